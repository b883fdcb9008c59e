//! Connection info for established tunnels.

use std::net::SocketAddr;

use crate::error::Endpoint;
use crate::tunnel::Destination;

/// Addresses describing an established tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    endpoint: Endpoint,
    destination: Destination,
}

impl TunnelInfo {
    pub(crate) fn new(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        endpoint: Endpoint,
        destination: Destination,
    ) -> Self {
        Self {
            local_addr,
            peer_addr,
            endpoint,
            destination,
        }
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> &SocketAddr {
        &self.local_addr
    }

    /// Address the socket is connected to: the proxy, or the destination
    /// itself in direct mode.
    pub fn peer_addr(&self) -> &SocketAddr {
        &self.peer_addr
    }

    /// Which kind of endpoint the socket is connected to.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// True if traffic is relayed by a proxy.
    pub fn is_proxied(&self) -> bool {
        self.endpoint == Endpoint::Proxy
    }

    /// The destination reached through the tunnel.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}
