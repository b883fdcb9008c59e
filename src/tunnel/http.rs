//! HTTP `CONNECT` tunnels.
//!
//! The handshake is a single request/response exchange:
//!
//! ```text
//! CONNECT example.com:443 HTTP/1.1\r\n
//! Proxy-Authorization: Basic dTpw\r\n
//! \r\n
//! ```
//!
//! The proxy reply is scanned for an `HTTP/<version> <code>` status line, and
//! only `200` is accepted. After that, every byte on the socket belongs to the
//! destination.

use std::io;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use ::http::{StatusCode, Version};
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::Instrument as _;

use super::{ensure_connected, BoxFuture, Destination, Negotiated, TunnelStrategy};
use crate::error::{Endpoint, Error, ProtocolError};
use crate::settings::{Credentials, Settings};

/// Floor on how long to wait for the proxy to start answering.
const MIN_RESPONSE_WAIT: Duration = Duration::from_millis(10);

/// Size of each read while draining the proxy response.
const READ_CHUNK: usize = 512;

/// Stop draining the response once this many bytes have been buffered.
const MAX_RESPONSE_LENGTH: usize = 64 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Tunnels through an HTTP proxy with a `CONNECT` request.
#[derive(Debug, Clone)]
pub struct HttpTunnel {
    version: Version,
}

impl Default for HttpTunnel {
    fn default() -> Self {
        Self {
            version: Version::HTTP_11,
        }
    }
}

impl HttpTunnel {
    /// A `CONNECT` strategy speaking HTTP/1.1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the HTTP version sent in the request line.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// The HTTP version sent in the request line.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Run the handshake, returning any bytes read past the proxy's response.
    async fn handshake(
        &self,
        destination: &Destination,
        socket: &mut TcpStream,
        settings: &Settings,
    ) -> Result<Bytes, Error> {
        let request = connect_request(destination, self.version, settings.credentials.as_ref());
        send_request(socket, request.as_bytes(), settings.io_timeout()).await?;
        tracing::trace!("sent CONNECT request");

        let wait = settings.read_write_timeout.max(MIN_RESPONSE_WAIT);
        let mut response = receive_response(socket, wait).await?;

        let text = decode_ascii(&response);
        let (status_at, status) = parse_status(&text)?;

        if status != StatusCode::OK {
            tracing::debug!(%status, "proxy rejected tunnel");
            return Err(ProtocolError::TunnelRejected(status).into());
        }

        // Decoding is byte-for-byte, so offsets into `text` are offsets into `response`.
        let read_ahead = match header_end(&response[status_at..]) {
            Some(len) => response.split_off(status_at + len).freeze(),
            None => Bytes::new(),
        };

        tracing::trace!(%status, read_ahead = read_ahead.len(), "tunnel established");
        Ok(read_ahead)
    }
}

impl TunnelStrategy for HttpTunnel {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Proxy
    }

    fn negotiate<'a>(
        &'a self,
        host: &'a str,
        port: u32,
        mut socket: TcpStream,
        settings: &'a Settings,
    ) -> BoxFuture<'a, Result<Negotiated, Error>> {
        Box::pin(async move {
            let destination = Destination::new(host, port)?;
            let proxy = ensure_connected(&socket, Endpoint::Proxy)?;

            let span = tracing::debug_span!("connect", proxy.addr = %proxy, %destination);
            let result = self
                .handshake(&destination, &mut socket, settings)
                .instrument(span)
                .await;

            match result {
                Ok(read_ahead) => Ok(Negotiated::with_read_ahead(socket, read_ahead)),
                Err(error) => {
                    drop(socket);
                    Err(error)
                }
            }
        })
    }
}

/// Build the `CONNECT` request.
fn connect_request(
    destination: &Destination,
    version: Version,
    credentials: Option<&Credentials>,
) -> String {
    let mut request = format!(
        "CONNECT {destination} HTTP/{}\r\n",
        version_number(version)
    );
    if let Some(authorization) = credentials.and_then(proxy_authorization) {
        request.push_str("Proxy-Authorization: ");
        request.push_str(&authorization);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

/// The Basic `Proxy-Authorization` value, unless both fields are empty.
fn proxy_authorization(credentials: &Credentials) -> Option<String> {
    if credentials.is_empty() {
        return None;
    }

    let token = BASE64.encode(format!(
        "{}:{}",
        credentials.username(),
        credentials.password()
    ));
    Some(format!("Basic {token}"))
}

fn version_number(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    }
}

async fn send_request(
    socket: &mut TcpStream,
    request: &[u8],
    timeout: Option<Duration>,
) -> Result<(), ProtocolError> {
    let write = socket.write_all(request);
    let result = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out writing CONNECT request",
            )),
        },
        None => write.await,
    };
    result.map_err(ProtocolError::Io)
}

/// Wait up to `wait` for the proxy to answer, then drain what is available.
///
/// Once the first bytes arrive, reading continues while more data is
/// immediately available. If a status line has been seen but the head it
/// starts is not complete yet, reading also waits for the rest of the head,
/// until the same deadline. Returns an empty buffer if the proxy closed the
/// connection without writing anything.
async fn receive_response(socket: &TcpStream, wait: Duration) -> Result<BytesMut, Error> {
    let deadline = Instant::now() + wait;
    let mut response = BytesMut::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match tokio::time::timeout_at(deadline, socket.readable()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => return Err(ProtocolError::Io(error).into()),
            Err(_) if response.is_empty() => {
                tracing::debug!(timeout = ?wait, "no response from proxy");
                return Err(Error::Timeout(wait));
            }
            Err(_) => {
                tracing::debug!(buffered = response.len(), "response head incomplete at deadline");
                return Ok(response);
            }
        }

        loop {
            match socket.try_read(&mut chunk) {
                Ok(0) => return Ok(response),
                Ok(n) => {
                    response.extend_from_slice(&chunk[..n]);
                    if head_len(&response).is_some() || response.len() >= MAX_RESPONSE_LENGTH {
                        return Ok(response);
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(ProtocolError::Io(error).into()),
            }
        }

        // Readiness can be spurious, so an empty buffer keeps waiting. Without
        // a status line there is no head to wait for.
        if !response.is_empty() && find_status_line(&response).is_none() {
            return Ok(response);
        }
    }
}

/// Length of the response up to the end of the head which follows the
/// status line.
fn head_len(buf: &[u8]) -> Option<usize> {
    let (start, _) = find_status_line(buf)?;
    header_end(&buf[start..]).map(|len| start + len)
}

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len())
        .position(|window| window == HEADER_END)
        .map(|position| position + HEADER_END.len())
}

/// Decode as ASCII, replacing anything outside the range with `?`.
fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { char::from(b) } else { '?' })
        .collect()
}

/// Classify the proxy response by its status line.
///
/// Returns the offset where the status line starts, along with the code.
fn parse_status(response: &str) -> Result<(usize, StatusCode), ProtocolError> {
    if response.is_empty() {
        return Err(ProtocolError::Empty);
    }

    let (start, digits) = find_status_line(response.as_bytes()).ok_or(ProtocolError::Malformed)?;
    let status = StatusCode::from_bytes(digits).map_err(|_| {
        ProtocolError::InvalidStatus(String::from_utf8_lossy(digits).into_owned())
    })?;
    Ok((start, status))
}

/// Find the first `HTTP/<[0-9.]*> <ddd>` anywhere in `buf`.
///
/// Returns the offset of `HTTP/` and the three status digits.
fn find_status_line(buf: &[u8]) -> Option<(usize, &[u8])> {
    const PREFIX: &[u8] = b"HTTP/";

    let mut start = 0;
    while start + PREFIX.len() <= buf.len() {
        if !buf[start..].starts_with(PREFIX) {
            start += 1;
            continue;
        }

        let mut idx = start + PREFIX.len();
        while idx < buf.len() && (buf[idx].is_ascii_digit() || buf[idx] == b'.') {
            idx += 1;
        }

        if buf.get(idx) == Some(&b' ') {
            if let Some(code) = buf.get(idx + 1..idx + 4) {
                if code.iter().all(u8::is_ascii_digit) {
                    return Some((start, code));
                }
            }
        }

        start += 1;
    }
    None
}
