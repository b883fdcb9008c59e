//! Passthrough strategy for connections without a proxy.

use tokio::net::TcpStream;

use super::{ensure_connected, BoxFuture, Destination, Negotiated, TunnelStrategy};
use crate::error::{Endpoint, Error};
use crate::settings::Settings;

/// Connects straight to the destination.
///
/// The establisher opens the socket to the destination itself, so there is
/// nothing left to negotiate: the socket is returned as-is, with no bytes
/// written or read. This keeps a single code path for callers which may or
/// may not be configured with a proxy.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectTunnel {
    _priv: (),
}

impl DirectTunnel {
    /// Create a new direct strategy.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl TunnelStrategy for DirectTunnel {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Server
    }

    fn negotiate<'a>(
        &'a self,
        host: &'a str,
        port: u32,
        socket: TcpStream,
        _settings: &'a Settings,
    ) -> BoxFuture<'a, Result<Negotiated, Error>> {
        Box::pin(async move {
            Destination::new(host, port)?;
            ensure_connected(&socket, Endpoint::Server)?;
            tracing::trace!("direct tunnel, passing socket through");
            Ok(Negotiated::new(socket))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;

    use super::*;
    use crate::error::ArgumentError;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn passes_socket_through() {
        let _ = tracing_subscriber::fmt::try_init();

        let (client, mut server) = pair().await;
        let local = client.local_addr().unwrap();

        let negotiated = DirectTunnel::new()
            .negotiate("example.com", 443, client, &Settings::default())
            .await
            .unwrap();

        assert_eq!(negotiated.stream().local_addr().unwrap(), local);
        assert!(negotiated.read_ahead().is_empty());

        // Nothing was written to the peer.
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_millis(50), server.read(&mut buf)).await;
        assert!(read.is_err(), "no bytes should have been written");
    }

    #[tokio::test]
    async fn rejects_invalid_destination() {
        let (client, _server) = pair().await;
        let err = DirectTunnel::new()
            .negotiate("", 443, client, &Settings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Argument(ArgumentError::EmptyHost)));

        let (client, _server) = pair().await;
        let err = DirectTunnel::new()
            .negotiate("example.com", 70000, client, &Settings::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Argument(ArgumentError::PortOutOfRange(70000))
        ));
    }
}
