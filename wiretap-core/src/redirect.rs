//! Destination lookup: the boundary to the traffic-redirection collaborator.
//!
//! The collaborator steers application sockets to the proxy and tells us,
//! per accepted connection, where the client actually wanted to go. Two
//! implementations: a process-wide port map the collaborator populates, and
//! a Linux `SO_ORIGINAL_DST` fallback for iptables REDIRECT setups.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// The original destination of a redirected connection. Immutable per
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub version: IpVersion,
    pub ipv4: u32,
    pub ipv6: u128,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    V4,
    V6,
}

impl NetworkAddress {
    pub fn to_socket_addr(&self) -> SocketAddr {
        match self.version {
            IpVersion::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::from(self.ipv4)), self.port),
            IpVersion::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::from(self.ipv6)), self.port),
        }
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Self {
                version: IpVersion::V4,
                ipv4: u32::from(ip),
                ipv6: 0,
                port: addr.port(),
            },
            IpAddr::V6(ip) => Self {
                version: IpVersion::V6,
                ipv4: 0,
                ipv6: u128::from(ip),
                port: addr.port(),
            },
        }
    }
}

/// Lookup interface the dispatcher calls once per connection, keyed by the
/// client-side local port of the accepted socket.
pub trait DestinationLookup: Send + Sync {
    fn lookup_original_dest(&self, local_port: u16) -> Option<NetworkAddress>;
    fn release_original_dest(&self, local_port: u16);
}

/// Process-wide source-port map populated by the redirection collaborator.
/// Process-scoped lifetime; entries are released as connections close.
#[derive(Default)]
pub struct PortMap {
    entries: DashMap<u16, NetworkAddress>,
}

impl PortMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, local_port: u16, dest: NetworkAddress) {
        self.entries.insert(local_port, dest);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DestinationLookup for PortMap {
    fn lookup_original_dest(&self, local_port: u16) -> Option<NetworkAddress> {
        self.entries.get(&local_port).map(|entry| *entry.value())
    }

    fn release_original_dest(&self, local_port: u16) {
        self.entries.remove(&local_port);
    }
}

/// Original destination of a redirected socket (before iptables REDIRECT),
/// via the `SO_ORIGINAL_DST` socket option.
///
/// Example iptables rule:
/// ```bash
/// iptables -t nat -A PREROUTING -p tcp --dport 6379 -j REDIRECT --to-ports 16789
/// ```
#[cfg(target_os = "linux")]
pub fn original_dst(stream: &tokio::net::TcpStream) -> Option<NetworkAddress> {
    use std::os::fd::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len: libc::socklen_t =
        std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut addr_len as *mut libc::socklen_t,
        )
    };

    if result != 0 {
        tracing::debug!("Failed to get SO_ORIGINAL_DST");
        return None;
    }

    match addr.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr_in = unsafe { *((&addr) as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr_in.sin_addr.s_addr));
            let port = u16::from_be(addr_in.sin_port);
            Some(SocketAddr::new(ip.into(), port).into())
        }
        libc::AF_INET6 => {
            let addr_in6 = unsafe { *((&addr) as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(addr_in6.sin6_addr.s6_addr);
            let port = u16::from_be(addr_in6.sin6_port);
            Some(SocketAddr::new(ip.into(), port).into())
        }
        _ => None,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn original_dst(_stream: &tokio::net::TcpStream) -> Option<NetworkAddress> {
    None
}
