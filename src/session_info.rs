use std::net::{Ipv4Addr, SocketAddr};

#[derive(Hash, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug, Default)]
pub enum IpProtocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
        }
    }
}

/// The 5-tuple of a flow as seen by the virtual stack, plus a process-wide
/// sequence number used to tell apart flows that reuse the same tuple.
#[derive(Hash, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub struct SessionInfo {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub protocol: IpProtocol,
    id: u64,
}

impl Default for SessionInfo {
    fn default() -> Self {
        let src = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0);
        let dst = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0);
        Self::new(src, dst, IpProtocol::Tcp)
    }
}

static SESSION_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

impl SessionInfo {
    pub fn new(src: SocketAddr, dst: SocketAddr, protocol: IpProtocol) -> Self {
        let id = SESSION_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self { src, dst, protocol, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_dns(&self) -> bool {
        self.protocol == IpProtocol::Udp && self.dst.port() == crate::dns::DNS_PORT
    }
}

impl std::fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#{} {} {} -> {}", self.id, self.protocol, self.src, self.dst)
    }
}
