//! Establishing connections through a tunnel strategy.
//!
//! The [`ConnectionEstablisher`] owns a [`TunnelStrategy`] and a [`Settings`]
//! value. Each call to [`ConnectionEstablisher::establish`] opens a fresh
//! socket, bounded by the connect timeout, and hands it to the strategy.
//!
//! An attempt moves through these states:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Negotiating -> Established
//!              \             \             \
//!               `-------------`-------------`----> Failed
//! ```
//!
//! Whenever an attempt fails, the socket is dropped (and so closed) before
//! the error is returned.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Uri;
use tokio::net::{TcpSocket, TcpStream};
use tracing::Instrument as _;

use crate::dns;
use crate::error::{ConnectError, ConnectErrorKind, Endpoint, Error};
use crate::info::TunnelInfo;
use crate::settings::Settings;
use crate::stream::TunnelStream;
use crate::tunnel::{BoxFuture, Destination, TunnelStrategy};

/// Opens connections to destinations, through the configured tunnel.
///
/// # Example
/// ```no_run
/// # use std::time::Duration;
/// # use hypertunnel::{ConnectionEstablisher, HttpTunnel, Settings};
/// # async fn run() -> Result<(), hypertunnel::Error> {
/// let settings = Settings::new("proxy.internal", 3128)
///     .with_connect_timeout(Duration::from_secs(5));
/// let establisher = ConnectionEstablisher::new(HttpTunnel::new(), settings);
///
/// let stream = establisher.establish("example.com", 443).await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionEstablisher<S> {
    strategy: Arc<S>,
    settings: Arc<Settings>,
}

impl<S: fmt::Debug> fmt::Debug for ConnectionEstablisher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEstablisher")
            .field("strategy", &self.strategy)
            .field("settings", &self.settings)
            .finish()
    }
}

impl<S> Clone for ConnectionEstablisher<S> {
    fn clone(&self) -> Self {
        Self {
            strategy: self.strategy.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<S> ConnectionEstablisher<S> {
    /// Create an establisher bound to one strategy and one set of settings.
    pub fn new(strategy: S, settings: Settings) -> Self {
        Self {
            strategy: Arc::new(strategy),
            settings: Arc::new(settings),
        }
    }

    /// The tunnel strategy.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// The settings used for every attempt.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

impl<S> ConnectionEstablisher<S>
where
    S: TunnelStrategy,
{
    /// Connect to `host:port`, tunneling through the proxy if the strategy
    /// uses one.
    ///
    /// Arguments and settings are validated before any network I/O.
    pub async fn establish(&self, host: &str, port: u32) -> Result<TunnelStream, Error> {
        let span = tracing::debug_span!("tunnel", %host, %port);
        let mut attempt = Attempt::default();
        let result = self
            .run(&mut attempt, host, port)
            .instrument(span.clone())
            .await;

        let _entered = span.enter();
        match &result {
            Ok(_) => attempt.transition(State::Established),
            Err(error) => {
                tracing::debug!(state = %attempt.state, %error, "connection attempt failed");
                attempt.transition(State::Failed);
            }
        }
        result
    }

    async fn run(
        &self,
        attempt: &mut Attempt,
        host: &str,
        port: u32,
    ) -> Result<TunnelStream, Error> {
        let destination = Destination::new(host, port)?;
        let endpoint = self.strategy.endpoint();
        self.settings.validate(endpoint == Endpoint::Proxy)?;

        let (target_host, target_port) = match endpoint {
            Endpoint::Proxy => (self.settings.host.as_str(), self.settings.port),
            Endpoint::Server => (destination.host(), destination.port()),
        };

        attempt.transition(State::Connecting);
        let socket = self.connect(target_host, target_port, endpoint).await?;
        attempt.transition(State::Connected);

        let (local_addr, peer_addr) = addresses(&socket)
            .map_err(|error| ConnectError::new(endpoint, ConnectErrorKind::Io(error)))?;
        tracing::trace!(local.addr = %local_addr, peer.addr = %peer_addr, "tcp connected");

        attempt.transition(State::Negotiating);
        let (socket, read_ahead) = self
            .strategy
            .negotiate(host, port, socket, &self.settings)
            .await?
            .into_parts();

        let info = TunnelInfo::new(local_addr, peer_addr, endpoint, destination);
        Ok(TunnelStream::new(
            socket,
            read_ahead,
            info,
            self.settings.io_timeout(),
        ))
    }

    /// Open a socket to the target, bounded by the connect timeout.
    async fn connect(
        &self,
        host: &str,
        port: u16,
        endpoint: Endpoint,
    ) -> Result<TcpStream, ConnectError> {
        let timeout = self.settings.connect_timeout;
        match tokio::time::timeout(timeout, self.connect_any(host, port, endpoint)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::trace!(?timeout, "connection timed out");
                Err(ConnectError::new(
                    endpoint,
                    ConnectErrorKind::Timeout(timeout),
                ))
            }
        }
    }

    /// Try each resolved address in turn.
    async fn connect_any(
        &self,
        host: &str,
        port: u16,
        endpoint: Endpoint,
    ) -> Result<TcpStream, ConnectError> {
        let addrs = dns::resolve(host, port)
            .await
            .map_err(|error| ConnectError::new(endpoint, ConnectErrorKind::Resolve(error)))?;

        let mut last_error = None;
        for addr in addrs {
            let span = tracing::trace_span!("tcp", remote.addr = %addr);
            match connect(&addr, &self.settings).instrument(span).await {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    tracing::debug!(%addr, %error, "connect attempt failed");
                    last_error = Some(error);
                }
            }
        }

        let kind = match last_error {
            Some(error) => ConnectErrorKind::Io(error),
            None => ConnectErrorKind::NoAddresses,
        };
        Err(ConnectError::new(endpoint, kind))
    }
}

fn addresses(socket: &TcpStream) -> io::Result<(SocketAddr, SocketAddr)> {
    Ok((socket.local_addr()?, socket.peer_addr()?))
}

async fn connect(addr: &SocketAddr, settings: &Settings) -> io::Result<TcpStream> {
    let socket = open_socket(addr, settings)?;
    socket.connect(*addr).await
}

fn open_socket(addr: &SocketAddr, settings: &Settings) -> io::Result<TcpSocket> {
    use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    tracing::trace!("tcp socket opened");

    let guard = tracing::trace_span!("socket_options").entered();

    // Tokio expects sockets it adopts to already be non-blocking.
    socket.set_nonblocking(true)?;

    if let Some(dur) = settings.keep_alive {
        let conf = TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket.set_tcp_keepalive(&conf) {
            tracing::warn!("tcp set_keepalive error: {}", e);
        }
    }

    if settings.nodelay {
        if let Err(e) = socket.set_nodelay(true) {
            tracing::warn!("tcp set_nodelay error: {}", e);
        }
    }

    drop(guard);

    Ok(TcpSocket::from_std_stream(socket.into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Connecting,
    Connected,
    Negotiating,
    Established,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "idle",
            State::Connecting => "connecting",
            State::Connected => "connected",
            State::Negotiating => "negotiating",
            State::Established => "established",
            State::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks the state of one connection attempt.
#[derive(Debug)]
struct Attempt {
    state: State,
}

impl Default for Attempt {
    fn default() -> Self {
        Self { state: State::Idle }
    }
}

impl Attempt {
    fn transition(&mut self, next: State) {
        debug_assert!(
            !matches!(self.state, State::Established | State::Failed),
            "attempt already finished in state {}",
            self.state
        );
        tracing::trace!(from = %self.state, to = %next, "connection state");
        self.state = next;
    }
}

impl<S> tower::Service<Destination> for ConnectionEstablisher<S>
where
    S: TunnelStrategy + 'static,
{
    type Response = TunnelStream;
    type Error = Error;
    type Future = BoxFuture<'static, Result<TunnelStream, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Destination) -> Self::Future {
        let establisher = self.clone();
        Box::pin(async move {
            establisher
                .establish(req.host(), req.port().into())
                .await
        })
    }
}

impl<S> tower::Service<Uri> for ConnectionEstablisher<S>
where
    S: TunnelStrategy + 'static,
{
    type Response = TunnelStream;
    type Error = Error;
    type Future = BoxFuture<'static, Result<TunnelStream, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Uri) -> Self::Future {
        match Destination::try_from(&req) {
            Ok(destination) => tower::Service::<Destination>::call(self, destination),
            Err(error) => Box::pin(std::future::ready(Err(error.into()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;
    use tower::ServiceExt as _;

    use super::*;
    use crate::error::{ArgumentError, ProtocolError};
    use crate::tunnel::{DirectTunnel, HttpTunnel};

    use static_assertions::assert_impl_all;

    assert_impl_all!(ConnectionEstablisher<HttpTunnel>: Send, Sync, Clone);
    assert_impl_all!(TunnelStream: Send);

    /// A proxy which answers the first CONNECT with `reply`, then echoes.
    async fn proxy(reply: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 256];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                head.extend_from_slice(&buf[..n]);
            }
            socket.write_all(reply.as_bytes()).await.unwrap();

            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                if socket.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        });
        addr
    }

    async fn echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (mut read, mut write) = socket.split();
            let _ = tokio::io::copy(&mut read, &mut write).await;
        });
        addr
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn proxy_settings(addr: SocketAddr) -> Settings {
        Settings::new(addr.ip().to_string(), addr.port())
            .with_connect_timeout(Duration::from_secs(2))
            .with_read_write_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn establish_through_proxy() {
        let _ = tracing_subscriber::fmt::try_init();

        let addr = proxy("HTTP/1.1 200 OK\r\n\r\n").await;
        let establisher = ConnectionEstablisher::new(HttpTunnel::new(), proxy_settings(addr));

        let mut stream = establisher.establish("example.com", 443).await.unwrap();
        assert!(stream.info().is_proxied());
        assert_eq!(*stream.info().peer_addr(), addr);
        assert_eq!(stream.info().destination().to_string(), "example.com:443");

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn establish_rejected_by_proxy() {
        let addr = proxy("HTTP/1.1 403 Forbidden\r\n\r\n").await;
        let establisher = ConnectionEstablisher::new(HttpTunnel::new(), proxy_settings(addr));

        let err = establisher.establish("example.com", 443).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::TunnelRejected(code)) if code == 403
        ));
    }

    #[tokio::test]
    async fn invalid_destination_opens_no_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let establisher = ConnectionEstablisher::new(HttpTunnel::new(), proxy_settings(addr));

        for port in [0, 70000] {
            let err = establisher.establish("example.com", port).await.unwrap_err();
            assert!(err.is_argument());
        }
        let err = establisher.establish("", 443).await.unwrap_err();
        assert!(matches!(err, Error::Argument(ArgumentError::EmptyHost)));

        let accepted = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(accepted.is_err(), "no connection should have been made");
    }

    #[tokio::test]
    async fn invalid_settings_rejected() {
        let establisher = ConnectionEstablisher::new(HttpTunnel::new(), Settings::default());
        let err = establisher.establish("example.com", 443).await.unwrap_err();
        assert!(matches!(err, Error::Argument(ArgumentError::EmptyProxyHost)));
    }

    #[tokio::test]
    async fn refused_proxy_is_a_connect_error() {
        let port = closed_port().await;
        let settings = Settings::new("127.0.0.1", port);
        let establisher = ConnectionEstablisher::new(HttpTunnel::new(), settings);

        let err = establisher.establish("example.com", 443).await.unwrap_err();
        match err {
            Error::Connect(err) => {
                assert_eq!(err.endpoint(), Endpoint::Proxy);
                assert!(matches!(err.kind(), ConnectErrorKind::Io(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    /// A listener whose accept queue is full, so further SYNs go unanswered.
    async fn saturated_listener() -> (TcpListener, Vec<TcpStream>) {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut held = Vec::new();
        for _ in 0..16 {
            let attempt = TcpStream::connect(addr);
            match tokio::time::timeout(Duration::from_millis(100), attempt).await {
                Ok(Ok(stream)) => held.push(stream),
                _ => break,
            }
        }
        (listener, held)
    }

    #[tokio::test]
    async fn stalled_proxy_times_out() {
        let _ = tracing_subscriber::fmt::try_init();

        let (listener, _held) = saturated_listener().await;
        let addr = listener.local_addr().unwrap();

        let connect_timeout = Duration::from_millis(200);
        let settings = Settings::new(addr.ip().to_string(), addr.port())
            .with_connect_timeout(connect_timeout);
        let establisher = ConnectionEstablisher::new(HttpTunnel::new(), settings);

        let started = Instant::now();
        let err = establisher.establish("example.com", 443).await.unwrap_err();
        let elapsed = started.elapsed();

        match err {
            Error::Connect(err) => {
                assert_eq!(err.endpoint(), Endpoint::Proxy);
                assert!(err.is_timeout(), "expected a timeout, got {err:?}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(elapsed >= connect_timeout, "took {elapsed:?}");
        assert!(elapsed < connect_timeout * 3, "took {elapsed:?}");
    }

    #[tokio::test]
    async fn direct_connects_to_destination() {
        let addr = echo().await;
        let establisher = ConnectionEstablisher::new(DirectTunnel::new(), Settings::default());

        let mut stream = establisher
            .establish("127.0.0.1", addr.port().into())
            .await
            .unwrap();
        assert!(!stream.info().is_proxied());
        assert_eq!(*stream.info().peer_addr(), addr);

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn direct_refused_names_server() {
        let port = closed_port().await;
        let establisher = ConnectionEstablisher::new(DirectTunnel::new(), Settings::default());

        let err = establisher
            .establish("127.0.0.1", port.into())
            .await
            .unwrap_err();
        match err {
            Error::Connect(err) => assert_eq!(err.endpoint(), Endpoint::Server),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn establisher_as_service() {
        let addr = proxy("HTTP/1.0 200 Connection established\r\n\r\n").await;
        let establisher = ConnectionEstablisher::new(HttpTunnel::new(), proxy_settings(addr));

        let uri: Uri = "https://example.com/".parse().unwrap();
        let stream = establisher.clone().oneshot(uri).await.unwrap();
        assert_eq!(stream.info().destination().port(), 443);

        let uri: Uri = "/no/authority".parse().unwrap();
        let err = establisher.oneshot(uri).await.unwrap_err();
        assert!(err.is_argument());
    }

    #[test]
    fn state_names() {
        assert_eq!(State::Negotiating.to_string(), "negotiating");
        let mut attempt = Attempt::default();
        attempt.transition(State::Connecting);
        attempt.transition(State::Failed);
        assert_eq!(attempt.state, State::Failed);
    }

    /// Records each event's fields with the names of the spans it was emitted in.
    #[derive(Clone, Default)]
    struct EventRecorder {
        events: Arc<std::sync::Mutex<Vec<(String, Vec<String>)>>>,
    }

    struct FieldsVisitor(String);

    impl tracing::field::Visit for FieldsVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
            self.0.push_str(&format!("{}={:?} ", field.name(), value));
        }
    }

    impl<S> tracing_subscriber::Layer<S> for EventRecorder
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let mut fields = FieldsVisitor(String::new());
            event.record(&mut fields);
            let spans = ctx
                .event_scope(event)
                .map(|scope| scope.map(|span| span.name().to_owned()).collect())
                .unwrap_or_default();
            self.events.lock().unwrap().push((fields.0, spans));
        }
    }

    #[tokio::test]
    async fn final_state_is_traced_in_tunnel_span() {
        use tracing_subscriber::layer::SubscriberExt as _;

        let recorder = EventRecorder::default();
        let subscriber = tracing_subscriber::registry().with(recorder.clone());
        let _default = tracing::subscriber::set_default(subscriber);

        let establisher = ConnectionEstablisher::new(HttpTunnel::new(), Settings::default());
        establisher.establish("example.com", 443).await.unwrap_err();

        let events = recorder.events.lock().unwrap();
        let failed = events
            .iter()
            .find(|(fields, _)| fields.contains("connection attempt failed"))
            .expect("failure event recorded");
        assert!(failed.1.iter().any(|name| name == "tunnel"), "{failed:?}");

        let transition = events
            .iter()
            .find(|(fields, _)| fields.contains("to=failed"))
            .expect("transition to failed recorded");
        assert!(transition.1.iter().any(|name| name == "tunnel"), "{transition:?}");
    }
}
