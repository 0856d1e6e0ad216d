#[cfg(not(unix))]
compile_error!("tun2socks-relay talks to the tunnel over unix datagram sockets and only builds on unix targets");

use crate::{
    dns_cache::{DnsAnswerCache, DnsFlowCache},
    handler::{TcpHandler, UdpHandler},
    stack::{StackConfig, VirtualStack},
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

pub use {
    args::{ArgVerbosity, Args},
    error::{BoxError, Error, Result},
    relay::{DEFAULT_MTU, Relay, validate_packet},
    session_info::{IpProtocol, SessionInfo},
    socks::ProxyConfig,
    stack::{PacketIngest, StackInput},
    traffic_status::{TrafficStats, TrafficStatus},
    transport::{InboundEndpoint, OutboundEndpoint, OutputSink, TransportConfig, TunnelTransport},
};

mod args;
pub mod dns;
pub mod dns_cache;
mod error;
pub mod handler;
mod relay;
mod session_info;
pub mod socks;
pub mod stack;
mod traffic_status;
mod transport;

const TRAFFIC_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Opens the tunnel sockets described by `args` and relays until `shutdown`
/// fires. Fails early if the proxy cannot be resolved or a socket cannot be
/// opened.
pub async fn run(args: Args, shutdown: CancellationToken) -> Result<()> {
    let proxy = args.proxy_config()?;
    log::info!("Proxy SOCKS5 server: {}", proxy.addr);
    let transport = TunnelTransport::open(&args.transport_config())?;
    run_with_transport(&args, proxy, transport, shutdown).await
}

/// Runs the relay over an already opened transport.
pub async fn run_with_transport(
    args: &Args,
    proxy: ProxyConfig,
    transport: TunnelTransport,
    shutdown: CancellationToken,
) -> Result<()> {
    let token = shutdown.child_token();
    let stats = Arc::new(TrafficStats::default());
    let (inbound, outbound) = transport.split();

    let stack_config = StackConfig {
        mtu: args.mtu,
        udp_timeout: args.udp_idle_timeout(),
    };
    let (mut stack, input) = VirtualStack::new(stack_config, Arc::new(outbound), stats.clone());

    let dns_flows = Arc::new(DnsFlowCache::new(args.dns_query_timeout()));
    let dns_answers = Arc::new(DnsAnswerCache::new());
    stack
        .register_tcp_handler(Arc::new(TcpHandler::new(proxy.clone(), args.tcp_idle_timeout())))
        .register_udp_handler(Arc::new(UdpHandler::new(
            proxy,
            args.udp_idle_timeout(),
            dns_flows.clone(),
            dns_answers.clone(),
            args.ipv6_enabled,
        )));

    let mut stack_task = tokio::spawn(stack.run(token.child_token()));
    let sweeper = tokio::spawn(dns_cache::sweep_dns_caches(dns_flows, dns_answers, token.child_token()));
    let reporter = tokio::spawn(traffic_status::report_traffic(
        stats.clone(),
        TRAFFIC_REPORT_INTERVAL,
        token.child_token(),
    ));

    log::info!("Relay started, mtu {}", args.mtu);
    let relay = Relay::new(inbound, input, stats.clone(), args.mtu);
    let mut stack_result = None;
    let relay_result = tokio::select! {
        result = relay.run(token.child_token()) => result,
        result = &mut stack_task => {
            stack_result = Some(result);
            Ok(())
        }
    };

    token.cancel();
    let stack_result = match stack_result {
        Some(result) => result,
        None => stack_task.await,
    };
    let stack_result = stack_result.map_err(std::io::Error::from)?;
    sweeper.await.map_err(std::io::Error::from)?;
    reporter.await.map_err(std::io::Error::from)?;

    log::info!("Relay stopped: {}", stats.snapshot());
    relay_result.and(stack_result)
}
