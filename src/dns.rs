//! DNS resolution for connect targets.

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// Resolve `host:port` to socket addresses.
///
/// IP literals are returned directly. Host names are resolved with the
/// system resolver (`getaddrinfo`) on tokio's blocking pool.
pub(crate) async fn resolve(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let host: Box<str> = host.into();
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || {
        tracing::trace_span!(parent: &span, "getaddrinfo").in_scope(|| {
            tracing::trace!("dns resolution starting");
            (host.as_ref(), port)
                .to_socket_addrs()
                .map(|addrs| addrs.collect::<Vec<_>>())
        })
    })
    .await
    .map_err(|join_err| {
        if join_err.is_cancelled() {
            io::Error::new(io::ErrorKind::Interrupted, join_err)
        } else {
            io::Error::other(join_err)
        }
    })?
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[tokio::test]
    async fn literal_addresses_skip_lookup() {
        let addrs = resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addrs, vec![SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 8080)]);

        let addrs = resolve("[::1]", 443).await.unwrap();
        assert_eq!(addrs, vec!["[::1]:443".parse().unwrap()]);
    }

    #[tokio::test]
    async fn resolves_localhost() {
        let addrs = resolve("localhost", 80).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|addr| addr.port() == 80));
    }
}
