use crate::{
    error::{Error, Result},
    stack::PacketIngest,
    traffic_status::TrafficStats,
    transport::InboundEndpoint,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// MTU of the tunnel in the reference deployment.
pub const DEFAULT_MTU: u16 = 1500;

/// Back-to-back read failures after which the inbound endpoint is treated as
/// gone rather than flaky.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 64;

/// Checks that `packet` can be an IP packet: non-empty, within the MTU and
/// carrying version 4 or 6.
pub fn validate_packet(packet: &[u8], mtu: usize) -> Result<()> {
    let len = packet.len();
    if len == 0 {
        return Err(Error::MalformedPacket { len, reason: "empty datagram" });
    }
    if len > mtu {
        return Err(Error::MalformedPacket { len, reason: "larger than MTU" });
    }
    match packet[0] >> 4 {
        4 | 6 => Ok(()),
        _ => Err(Error::MalformedPacket { len, reason: "not an IPv4 or IPv6 packet" }),
    }
}

/// Moves packets from the inbound endpoint into the virtual stack, one at a
/// time and in receipt order.
pub struct Relay<I> {
    inbound: InboundEndpoint,
    ingest: I,
    stats: Arc<TrafficStats>,
    mtu: usize,
}

impl<I: PacketIngest> Relay<I> {
    pub fn new(inbound: InboundEndpoint, ingest: I, stats: Arc<TrafficStats>, mtu: u16) -> Self {
        Self {
            inbound,
            ingest,
            stats,
            mtu: mtu as usize,
        }
    }

    /// Runs until `shutdown` fires or the stack stops accepting packets.
    /// Read errors and malformed packets are logged and skipped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        // One spare byte tells an MTU-sized datagram from an oversized one.
        let mut buf = vec![0_u8; self.mtu + 1];
        let mut read_errors = 0_u32;
        loop {
            let len = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    log::info!("relay loop cancelled");
                    return Ok(());
                }
                len = self.inbound.recv(&mut buf) => len,
            };
            let len = match len {
                Ok(len) => {
                    read_errors = 0;
                    len
                }
                Err(err) => {
                    log::warn!("Failed to read packet {}", err);
                    self.stats.record_read_error();
                    read_errors += 1;
                    if read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        return Err(format!("inbound endpoint failed {} times in a row: {}", read_errors, err).into());
                    }
                    continue;
                }
            };

            let packet = &buf[..len];
            if let Err(err) = validate_packet(packet, self.mtu) {
                log::warn!("dropping inbound packet: {}", err);
                self.stats.record_malformed();
                continue;
            }
            self.stats.record_rx(len);
            self.ingest.ingest(packet).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ipv4_and_ipv6() {
        assert!(validate_packet(&[0x45, 0, 0, 20], 1500).is_ok());
        assert!(validate_packet(&[0x60, 0, 0, 0], 1500).is_ok());
    }

    #[test]
    fn rejects_malformed_packets() {
        assert!(matches!(
            validate_packet(&[], 1500),
            Err(Error::MalformedPacket { len: 0, .. })
        ));
        assert!(matches!(
            validate_packet(&[0x15, 0], 1500),
            Err(Error::MalformedPacket { len: 2, .. })
        ));
        let oversized = vec![0x45; 1501];
        assert!(matches!(
            validate_packet(&oversized, 1500),
            Err(Error::MalformedPacket { len: 1501, .. })
        ));
        assert!(validate_packet(&oversized[..1500], 1500).is_ok());
    }
}
