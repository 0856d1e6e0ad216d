use crate::{
    error::{Error, Result},
    handler::FlowHandler,
    session_info::{IpProtocol, SessionInfo},
    traffic_status::TrafficStats,
    transport::OutputSink,
};
use ipstack::{IpStackStream, IpStackTcpStream, IpStackUdpStream};
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Packets buffered between the relay loop and the stack before ingest waits.
const STACK_CHANNEL_SIZE: usize = 1024;

/// How long shutdown waits for in-flight flows to finish.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Entry point for raw packets read from the tunnel.
#[async_trait::async_trait]
pub trait PacketIngest: Send + Sync {
    async fn ingest(&self, packet: &[u8]) -> Result<()>;
}

/// Sending side of the stack's packet queue. Packets are handed over in
/// call order.
#[derive(Clone, Debug)]
pub struct StackInput {
    tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait::async_trait]
impl PacketIngest for StackInput {
    async fn ingest(&self, packet: &[u8]) -> Result<()> {
        self.tx
            .send(packet.to_vec())
            .await
            .map_err(|_| Error::from("virtual stack input closed"))
    }
}

/// The device ipstack drives: reads yield queued inbound packets one at a
/// time, writes go straight to the output sink. Once every [`StackInput`] is
/// gone, reads fail with `BrokenPipe` so the stack's device loop stops.
pub struct PacketDevice {
    rx: mpsc::Receiver<Vec<u8>>,
    sink: Arc<dyn OutputSink>,
    stats: Arc<TrafficStats>,
}

impl PacketDevice {
    pub fn new(sink: Arc<dyn OutputSink>, stats: Arc<TrafficStats>) -> (Self, StackInput) {
        let (tx, rx) = mpsc::channel(STACK_CHANNEL_SIZE);
        (Self { rx, sink, stats }, StackInput { tx })
    }
}

impl AsyncRead for PacketDevice {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        loop {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(packet)) => {
                    if packet.len() > buf.remaining() {
                        self.stats.record_malformed();
                        log::warn!("dropping {} byte packet larger than the stack buffer", packet.len());
                        continue;
                    }
                    buf.put_slice(&packet);
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(None) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "stack input closed")));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for PacketDevice {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.sink.poll_output(cx, buf) {
            Poll::Ready(Ok(len)) => {
                if len < buf.len() {
                    log::warn!("outbound packet truncated: {} of {} bytes written", len, buf.len());
                    self.stats.record_write_error();
                } else {
                    self.stats.record_tx(len);
                }
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(err)) => {
                // Drop the packet; the stack keeps running.
                log::warn!("Failed to write packet {}", err);
                self.stats.record_write_error();
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Copy, Clone, Debug)]
pub struct StackConfig {
    pub mtu: u16,
    pub udp_timeout: Duration,
}

/// User-space IP stack plus the handlers it dispatches new flows to.
pub struct VirtualStack {
    ip_stack: ipstack::IpStack,
    tcp_handler: Option<Arc<dyn FlowHandler<IpStackTcpStream>>>,
    udp_handler: Option<Arc<dyn FlowHandler<IpStackUdpStream>>>,
}

impl VirtualStack {
    /// Builds the stack around `sink`, which receives every packet the stack
    /// emits. Returns the stack and the handle that feeds it.
    pub fn new(config: StackConfig, sink: Arc<dyn OutputSink>, stats: Arc<TrafficStats>) -> (Self, StackInput) {
        let (device, input) = PacketDevice::new(sink, stats);

        let mut ipstack_config = ipstack::IpStackConfig::default();
        ipstack_config.mtu(config.mtu);
        ipstack_config.udp_timeout(config.udp_timeout);

        let stack = Self {
            ip_stack: ipstack::IpStack::new(ipstack_config, device),
            tcp_handler: None,
            udp_handler: None,
        };
        (stack, input)
    }

    pub fn register_tcp_handler(&mut self, handler: Arc<dyn FlowHandler<IpStackTcpStream>>) -> &mut Self {
        self.tcp_handler = Some(handler);
        self
    }

    pub fn register_udp_handler(&mut self, handler: Arc<dyn FlowHandler<IpStackUdpStream>>) -> &mut Self {
        self.udp_handler = Some(handler);
        self
    }

    /// Accepts flows until cancelled, then waits a bounded time for the
    /// running ones to drain.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();
        let result = self.accept_loop(&tracker, &shutdown).await;

        shutdown.cancel();
        tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
            log::warn!("{} flows still running after {:?}, abandoning them", tracker.len(), DRAIN_TIMEOUT);
        }
        result
    }

    async fn accept_loop(&mut self, tracker: &TaskTracker, shutdown: &CancellationToken) -> Result<()> {
        loop {
            let ip_stack_stream = tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("Shutdown received");
                    return Ok(());
                }
                ip_stack_stream = self.ip_stack.accept() => ip_stack_stream?,
            };
            match ip_stack_stream {
                IpStackStream::Tcp(tcp) => {
                    let info = SessionInfo::new(tcp.local_addr(), tcp.peer_addr(), IpProtocol::Tcp);
                    match &self.tcp_handler {
                        Some(handler) => spawn_flow(tracker, handler.clone(), info, tcp, shutdown.child_token()),
                        None => log::debug!("no TCP handler registered, dropping {}", info),
                    }
                }
                IpStackStream::Udp(udp) => {
                    let info = SessionInfo::new(udp.local_addr(), udp.peer_addr(), IpProtocol::Udp);
                    match &self.udp_handler {
                        Some(handler) => spawn_flow(tracker, handler.clone(), info, udp, shutdown.child_token()),
                        None => log::debug!("no UDP handler registered, dropping {}", info),
                    }
                }
                IpStackStream::UnknownTransport(u) => {
                    log::trace!("Received unknown transport packet {} -> {}", u.src_addr(), u.dst_addr());
                }
                IpStackStream::UnknownNetwork(pkt) => {
                    log::trace!("Received unknown network packet of {} bytes", pkt.len());
                }
            }
        }
    }
}

fn spawn_flow<S>(
    tracker: &TaskTracker,
    handler: Arc<dyn FlowHandler<S>>,
    info: SessionInfo,
    flow: S,
    shutdown: CancellationToken,
) where
    S: Send + 'static,
{
    tracker.spawn(async move {
        if let Err(err) = handler.handle(info, flow, shutdown).await {
            log::error!("{} error \"{}\"", info, err);
        }
    });
    log::trace!("Session count {}", tracker.len());
}
