use crate::{
    dns,
    dns_cache::{DnsAnswerCache, DnsFlowCache, DnsQueryKey, DnsRoute, DnsToken},
    error::Result,
    session_info::SessionInfo,
    socks::{self, ProxyConfig},
};
use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};
use tokio_util::sync::CancellationToken;

const TCP_BUFFER_SIZE: usize = 16 * 1024;
const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// Takes over one flow handed out by the virtual stack and serves it until
/// either side is done. Errors end that flow only.
#[async_trait::async_trait]
pub trait FlowHandler<S>: Send + Sync {
    async fn handle(&self, info: SessionInfo, flow: S, shutdown: CancellationToken) -> Result<()>;
}

/// Proxies TCP flows through SOCKS5 CONNECT.
#[derive(Clone, Debug)]
pub struct TcpHandler {
    proxy: ProxyConfig,
    idle_timeout: Duration,
}

impl TcpHandler {
    pub fn new(proxy: ProxyConfig, idle_timeout: Duration) -> Self {
        Self { proxy, idle_timeout }
    }
}

#[async_trait::async_trait]
impl<S> FlowHandler<S> for TcpHandler
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn handle(&self, info: SessionInfo, mut flow: S, shutdown: CancellationToken) -> Result<()> {
        log::info!("Beginning {}", info);
        let mut server = self.proxy.connect_backend().await?;
        let early_data = socks::connect(&mut server, info.dst, &self.proxy.credentials).await?;
        if !early_data.is_empty() {
            flow.write_all(&early_data).await?;
        }
        let (tx, rx) = relay_streams(&mut flow, &mut server, self.idle_timeout, &shutdown).await?;
        log::info!("Ending {} with ▲ {} : ▼ {}", info, tx, rx);
        Ok(())
    }
}

/// Copies bytes both ways, forwarding half-closes, until both directions are
/// finished. Returns bytes sent to `server` and bytes sent to `local`.
async fn relay_streams<L, R>(
    local: &mut L,
    server: &mut R,
    idle_timeout: Duration,
    shutdown: &CancellationToken,
) -> io::Result<(u64, u64)>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let mut local_buf = vec![0_u8; TCP_BUFFER_SIZE];
    let mut server_buf = vec![0_u8; TCP_BUFFER_SIZE];
    let (mut local_open, mut server_open) = (true, true);
    let (mut tx, mut rx) = (0_u64, 0_u64);

    while local_open || server_open {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(idle_timeout) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, format!("idle for {:?}", idle_timeout)));
            }
            len = local.read(&mut local_buf), if local_open => {
                let len = len?;
                if len == 0 {
                    local_open = false;
                    server.shutdown().await?;
                } else {
                    server.write_all(&local_buf[..len]).await?;
                    tx += len as u64;
                }
            }
            len = server.read(&mut server_buf), if server_open => {
                let len = len?;
                if len == 0 {
                    server_open = false;
                    local.shutdown().await?;
                } else {
                    local.write_all(&server_buf[..len]).await?;
                    rx += len as u64;
                }
            }
        }
    }
    Ok((tx, rx))
}

/// Proxies UDP flows through SOCKS5 UDP ASSOCIATE, with DNS-aware handling of
/// port 53 traffic.
#[derive(Clone)]
pub struct UdpHandler {
    proxy: ProxyConfig,
    idle_timeout: Duration,
    dns_flows: Arc<DnsFlowCache>,
    dns_answers: Arc<DnsAnswerCache>,
    ipv6_enabled: bool,
}

impl UdpHandler {
    pub fn new(
        proxy: ProxyConfig,
        idle_timeout: Duration,
        dns_flows: Arc<DnsFlowCache>,
        dns_answers: Arc<DnsAnswerCache>,
        ipv6_enabled: bool,
    ) -> Self {
        Self {
            proxy,
            idle_timeout,
            dns_flows,
            dns_answers,
            ipv6_enabled,
        }
    }

    /// Turns a DNS response from the relay into the bytes to hand to the
    /// client, or `None` if it matches no query this flow recorded.
    fn accept_dns_response(&self, info: &SessionInfo, pending: &mut HashMap<u16, DnsToken>, data: &[u8]) -> Option<Vec<u8>> {
        let token = dns::message_id(data).and_then(|id| pending.remove(&id));
        let route = token.and_then(|token| self.dns_flows.resolve(&token, data));
        let Some(route) = route else {
            log::debug!("{} dropping unmatched DNS response", info);
            return None;
        };
        if route.client != info.src {
            log::debug!("{} DNS response routed to {}, not this flow", info, route.client);
            return None;
        }
        let response = self.filter_dns_response(data);
        self.dns_answers.store(&response);
        Some(response)
    }

    /// Strips AAAA answers unless IPv6 is enabled.
    fn filter_dns_response(&self, data: &[u8]) -> Vec<u8> {
        if self.ipv6_enabled {
            return data.to_vec();
        }
        match dns::parse_data_to_dns_message(data, false) {
            Ok(mut message) => {
                dns::remove_ipv6_entries(&mut message);
                message.to_vec().unwrap_or_else(|_| data.to_vec())
            }
            Err(_) => data.to_vec(),
        }
    }
}

/// An established UDP ASSOCIATE: the control connection that keeps it alive
/// and the socket connected to the relay.
struct UdpAssociation {
    control: TcpStream,
    socket: UdpSocket,
}

impl UdpAssociation {
    async fn open(proxy: &ProxyConfig) -> Result<Self> {
        let mut control = proxy.connect_backend().await?;
        let relay = socks::udp_associate(&mut control, proxy.addr, &proxy.credentials).await?;
        let bind: SocketAddr = match relay {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(relay).await?;
        Ok(Self { control, socket })
    }

    /// Waits for the next relay datagram. The association is over once the
    /// proxy closes the control connection.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut byte = [0_u8; 1];
        tokio::select! {
            len = self.socket.recv(buf) => len,
            closed = self.control.read(&mut byte) => {
                let reason = match closed {
                    Ok(_) => io::Error::new(io::ErrorKind::ConnectionAborted, "UDP association closed by proxy"),
                    Err(err) => err,
                };
                Err(reason)
            }
        }
    }
}

async fn recv_association(association: Option<&mut UdpAssociation>, buf: &mut [u8]) -> io::Result<usize> {
    match association {
        Some(association) => association.recv(buf).await,
        None => std::future::pending().await,
    }
}

#[async_trait::async_trait]
impl<S> FlowHandler<S> for UdpHandler
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn handle(&self, info: SessionInfo, mut flow: S, shutdown: CancellationToken) -> Result<()> {
        log::info!("Beginning {}", info);
        let is_dns = info.is_dns();
        let mut association: Option<UdpAssociation> = None;
        let mut pending_dns = HashMap::<u16, DnsToken>::new();
        let mut local_buf = vec![0_u8; UDP_BUFFER_SIZE];
        let mut relay_buf = vec![0_u8; UDP_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.idle_timeout) => {
                    log::debug!("{} idle for {:?}", info, self.idle_timeout);
                    break;
                }
                len = flow.read(&mut local_buf) => {
                    let len = len?;
                    if len == 0 {
                        break;
                    }
                    let payload = &local_buf[..len];

                    if is_dns {
                        if let Some(answer) = self.dns_answers.query(payload) {
                            flow.write_all(&self.filter_dns_response(&answer)).await?;
                            continue;
                        }
                        if let Some(id) = dns::message_id(payload) {
                            let name = dns::parse_data_to_dns_message(payload, false)
                                .ok()
                                .and_then(|message| dns::extract_domain_from_dns_message(&message).ok());
                            let key = DnsQueryKey { client: info.src, server: info.dst, id };
                            let route = DnsRoute { client: info.src, server: info.dst, name };
                            pending_dns.insert(id, self.dns_flows.record(key, route));
                        }
                    }

                    if association.is_none() {
                        association = Some(UdpAssociation::open(&self.proxy).await?);
                    }
                    if let Some(association) = &association {
                        let datagram = socks::encode_udp_datagram(info.dst, payload)?;
                        association.socket.send(&datagram).await?;
                    }
                }
                len = recv_association(association.as_mut(), &mut relay_buf) => {
                    let len = len?;
                    let (header, data) = match socks::decode_udp_datagram(&relay_buf[..len]) {
                        Ok(decoded) => decoded,
                        Err(err) => {
                            log::debug!("{} dropping undecodable relay datagram: {}", info, err);
                            continue;
                        }
                    };
                    if header.frag != 0 {
                        log::debug!("{} dropping fragmented relay datagram", info);
                        continue;
                    }
                    if is_dns {
                        if let Some(response) = self.accept_dns_response(&info, &mut pending_dns, data) {
                            flow.write_all(&response).await?;
                        }
                    } else {
                        flow.write_all(data).await?;
                    }
                }
            }
        }
        log::info!("Ending {}", info);
        Ok(())
    }
}
