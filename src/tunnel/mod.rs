//! Tunnel strategies.
//!
//! A [`TunnelStrategy`] takes a socket which is already connected and turns it
//! into a connection to the destination. For an HTTP proxy this means sending a
//! `CONNECT` request and checking the reply ([`HttpTunnel`]); without a proxy,
//! the socket is already connected to the destination and is passed through
//! untouched ([`DirectTunnel`]).
//!
//! The strategy is chosen when the [`ConnectionEstablisher`][crate::ConnectionEstablisher]
//! is built, and also tells the establisher which [`Endpoint`] to connect to.

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use ::http::Uri;
use tokio::net::TcpStream;

use crate::error::{ArgumentError, ConnectError, Endpoint, Error};
use crate::settings::Settings;

pub mod direct;
pub mod http;

pub use self::direct::DirectTunnel;
pub use self::http::HttpTunnel;

/// Boxed future returned by [`TunnelStrategy::negotiate`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Negotiates a tunnel on an already-connected socket.
///
/// Implementations must check their arguments before touching the network,
/// and must drop the socket (closing it) on every error path.
pub trait TunnelStrategy: fmt::Debug + Send + Sync {
    /// The endpoint the transport connection should be opened to.
    fn endpoint(&self) -> Endpoint;

    /// Negotiate a tunnel to `host:port` over `socket`.
    fn negotiate<'a>(
        &'a self,
        host: &'a str,
        port: u32,
        socket: TcpStream,
        settings: &'a Settings,
    ) -> BoxFuture<'a, Result<Negotiated, Error>>;
}

impl<S> TunnelStrategy for Box<S>
where
    S: TunnelStrategy + ?Sized,
{
    fn endpoint(&self) -> Endpoint {
        (**self).endpoint()
    }

    fn negotiate<'a>(
        &'a self,
        host: &'a str,
        port: u32,
        socket: TcpStream,
        settings: &'a Settings,
    ) -> BoxFuture<'a, Result<Negotiated, Error>> {
        (**self).negotiate(host, port, socket, settings)
    }
}

impl<S> TunnelStrategy for Arc<S>
where
    S: TunnelStrategy + ?Sized,
{
    fn endpoint(&self) -> Endpoint {
        (**self).endpoint()
    }

    fn negotiate<'a>(
        &'a self,
        host: &'a str,
        port: u32,
        socket: TcpStream,
        settings: &'a Settings,
    ) -> BoxFuture<'a, Result<Negotiated, Error>> {
        (**self).negotiate(host, port, socket, settings)
    }
}

/// The result of a successful negotiation.
///
/// Holds the socket, now carrying the tunnel, and any bytes which were read
/// from it past the end of the handshake. Those bytes belong to the
/// destination and must be delivered before anything else read from the
/// socket.
#[derive(Debug)]
pub struct Negotiated {
    stream: TcpStream,
    read_ahead: Bytes,
}

impl Negotiated {
    /// A negotiated socket with no bytes read ahead.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_ahead: Bytes::new(),
        }
    }

    /// A negotiated socket with bytes that were read past the handshake.
    pub fn with_read_ahead<B>(stream: TcpStream, read_ahead: B) -> Self
    where
        B: Into<Bytes>,
    {
        Self {
            stream,
            read_ahead: read_ahead.into(),
        }
    }

    /// The negotiated socket.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Bytes read past the end of the handshake.
    pub fn read_ahead(&self) -> &Bytes {
        &self.read_ahead
    }

    /// Split into the socket and the read-ahead bytes.
    pub fn into_parts(self) -> (TcpStream, Bytes) {
        (self.stream, self.read_ahead)
    }
}

/// A validated destination host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    host: Box<str>,
    port: u16,
}

impl Destination {
    /// Validate a destination host and port.
    ///
    /// The host must not be empty and the port must be in `1..=65535`. The
    /// host is written into the `CONNECT` request line, so whitespace and
    /// control characters are rejected.
    pub fn new<H>(host: H, port: u32) -> Result<Self, ArgumentError>
    where
        H: AsRef<str>,
    {
        let host = host.as_ref();
        if host.is_empty() {
            return Err(ArgumentError::EmptyHost);
        }
        if host.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ArgumentError::InvalidHost(host.to_owned()));
        }

        let port = match u16::try_from(port) {
            Ok(0) | Err(_) => return Err(ArgumentError::PortOutOfRange(port)),
            Ok(port) => port,
        };

        Ok(Self {
            host: host.into(),
            port,
        })
    }

    /// The destination host, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The destination port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Formats as `host:port`, bracketing IPv6 literals.
impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl TryFrom<&Uri> for Destination {
    type Error = ArgumentError;

    fn try_from(uri: &Uri) -> Result<Self, Self::Error> {
        let host = uri.host().ok_or(ArgumentError::InvalidUri("missing host"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = match uri.port_u16() {
            Some(port) => port,
            None => match uri.scheme_str() {
                Some("http") | Some("ws") => 80,
                Some("https") | Some("wss") => 443,
                _ => return Err(ArgumentError::InvalidUri("missing port")),
            },
        };

        Destination::new(host, port.into())
    }
}

/// Check that a socket handed to a strategy is connected, returning its peer.
pub(crate) fn ensure_connected(
    socket: &TcpStream,
    endpoint: Endpoint,
) -> Result<SocketAddr, ConnectError> {
    socket
        .peer_addr()
        .map_err(|_| ConnectError::not_connected(endpoint))
}
