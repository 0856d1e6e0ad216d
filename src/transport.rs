use crate::error::Result;
use nix::sys::socket::{setsockopt, sockopt};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    task::{Context, Poll},
};
use tokio::net::UnixDatagram;

/// Receive/send buffer requested on the tunnel sockets so bursts are absorbed
/// instead of dropped.
pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Path the inbound endpoint binds to; the OS tunnel sends packets here.
    pub inbound_path: PathBuf,
    /// Path of the OS tunnel's socket that outbound packets are sent to.
    pub outbound_path: PathBuf,
    pub read_buffer_bytes: usize,
}

/// The pair of unix datagram sockets linking this process to the OS tunnel.
/// Each datagram carries exactly one raw IP packet.
#[derive(Debug)]
pub struct TunnelTransport {
    inbound: InboundEndpoint,
    outbound: Arc<UnixDatagram>,
}

impl TunnelTransport {
    /// Binds the inbound endpoint and connects the outbound one. If anything
    /// after the bind fails, the inbound socket file is removed again.
    ///
    /// Panics if called outside of tokio runtime
    pub fn open(config: &TransportConfig) -> Result<Self> {
        let inbound = InboundEndpoint::bind(&config.inbound_path)?;
        setsockopt(&inbound.socket, sockopt::RcvBuf, &config.read_buffer_bytes)?;

        let outbound = UnixDatagram::unbound()?;
        outbound.connect(&config.outbound_path).map_err(|err| {
            log::error!("failed to connect outbound socket {}: {}", config.outbound_path.display(), err);
            err
        })?;
        setsockopt(&outbound, sockopt::SndBuf, &config.read_buffer_bytes)?;

        log::info!(
            "tunnel transport ready: inbound {} outbound {}",
            config.inbound_path.display(),
            config.outbound_path.display()
        );
        Ok(Self {
            inbound,
            outbound: Arc::new(outbound),
        })
    }

    /// Wraps sockets that are already bound and connected. Nothing is
    /// unlinked when they are dropped.
    pub fn from_sockets(inbound: UnixDatagram, outbound: UnixDatagram) -> Self {
        Self {
            inbound: InboundEndpoint { socket: inbound, path: None },
            outbound: Arc::new(outbound),
        }
    }

    pub fn split(self) -> (InboundEndpoint, OutboundEndpoint) {
        (self.inbound, OutboundEndpoint { socket: self.outbound })
    }
}

/// Receiving half of the transport. Owned by the relay loop. A socket bound
/// by [`TunnelTransport::open`] has its file removed on drop.
#[derive(Debug)]
pub struct InboundEndpoint {
    socket: UnixDatagram,
    path: Option<PathBuf>,
}

impl InboundEndpoint {
    fn bind(path: &Path) -> Result<Self> {
        let socket = UnixDatagram::bind(path).map_err(|err| {
            log::error!("failed to bind inbound socket {}: {}", path.display(), err);
            err
        })?;
        Ok(Self {
            socket,
            path: Some(path.to_path_buf()),
        })
    }

    /// Receives one datagram. Cancel safe.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.socket.recv(buf).await
    }
}

impl Drop for InboundEndpoint {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            if let Err(err) = std::fs::remove_file(path) {
                log::warn!("failed to remove inbound socket {}: {}", path.display(), err);
            }
        }
    }
}

/// Sending half of the transport. Clones share the same socket; each send is a
/// single datagram, so concurrent writers never interleave packets.
#[derive(Clone, Debug)]
pub struct OutboundEndpoint {
    socket: Arc<UnixDatagram>,
}

/// Receives outbound packets from the virtual stack. The packet is only
/// borrowed for the duration of the call.
pub trait OutputSink: Send + Sync {
    fn poll_output(&self, cx: &mut Context<'_>, packet: &[u8]) -> Poll<std::io::Result<usize>>;
}

impl OutputSink for OutboundEndpoint {
    fn poll_output(&self, cx: &mut Context<'_>, packet: &[u8]) -> Poll<std::io::Result<usize>> {
        self.socket.poll_send(cx, packet)
    }
}

impl OutboundEndpoint {
    pub async fn send(&self, packet: &[u8]) -> std::io::Result<usize> {
        self.socket.send(packet).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tun2socks-relay-{}-{}.sock", name, std::process::id()))
    }

    #[tokio::test]
    async fn inbound_socket_file_is_removed_on_failure_and_drop() {
        let config = TransportConfig {
            inbound_path: socket_path("transport-in"),
            outbound_path: socket_path("transport-out"),
            read_buffer_bytes: 64 * 1024,
        };
        let _ = std::fs::remove_file(&config.inbound_path);
        let _ = std::fs::remove_file(&config.outbound_path);

        // No peer socket yet: the connect fails after the bind.
        assert!(TunnelTransport::open(&config).is_err());
        assert!(!config.inbound_path.exists());

        let tunnel = UnixDatagram::bind(&config.outbound_path).unwrap();
        let transport = TunnelTransport::open(&config).unwrap();
        assert!(config.inbound_path.exists());
        let (inbound, outbound) = transport.split();
        outbound.send(&[0x45, 0, 0, 20]).await.unwrap();
        let mut buf = [0_u8; 16];
        assert_eq!(tunnel.recv(&mut buf).await.unwrap(), 4);
        drop(inbound);
        assert!(!config.inbound_path.exists());

        // The same path can be bound again by the next run.
        let transport = TunnelTransport::open(&config).unwrap();
        drop(transport);
        assert!(!config.inbound_path.exists());

        drop(tunnel);
        std::fs::remove_file(&config.outbound_path).unwrap();
    }
}
