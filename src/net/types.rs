//! Network address type and routability filtering, grounded on the host
//! crate's `net::types::NetAddress`/`is_routable` but trimmed to what the
//! overlay actually consults: `CheckServiceNodeInetAddressValid` only needs
//! the IP/port and a routability check, not the full presence-protocol
//! service-bitfield encoding.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// IP + port, as carried on the wire inside `snstrt`/`snstop`/`snping` and
/// compared for registry admission (`inetAddress.port == servicePort`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddress {
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Rejects private/loopback/link-local/documentation ranges, the way the
    /// address manager refuses to gossip unroutable peers.
    pub fn is_routable(&self) -> bool {
        match self.ip {
            IpAddr::V4(v4) => is_routable_v4(v4),
            IpAddr::V6(v6) => is_routable_v6(v6),
        }
    }
}

impl std::fmt::Display for NetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

fn is_routable_v4(ip: Ipv4Addr) -> bool {
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        || ip.octets()[0] == 0)
}

fn is_routable_v6(ip: Ipv6Addr) -> bool {
    let is_unicast_link_local = (ip.segments()[0] & 0xffc0) == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || is_unicast_link_local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_v4_is_not_routable() {
        let a = NetAddress::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 1000);
        assert!(!a.is_routable());
    }

    #[test]
    fn public_v4_is_routable() {
        let a = NetAddress::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 1000);
        assert!(a.is_routable());
    }

    #[test]
    fn display_matches_signing_string_format() {
        let a = NetAddress::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 39999);
        assert_eq!(a.to_string(), "127.0.0.1:39999");
    }
}
