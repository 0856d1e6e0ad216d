use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Point-in-time copy of [`TrafficStats`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TrafficStatus {
    /// Packets and bytes written to the tunnel (stack -> OS).
    pub tx_packets: u64,
    pub tx: u64,
    /// Packets and bytes read from the tunnel (OS -> stack).
    pub rx_packets: u64,
    pub rx: u64,
    pub malformed: u64,
    pub read_errors: u64,
    pub write_errors: u64,
}

/// Relay-wide counters shared between the inbound loop and the output sink.
#[derive(Debug, Default)]
pub struct TrafficStats {
    tx_packets: AtomicU64,
    tx: AtomicU64,
    rx_packets: AtomicU64,
    rx: AtomicU64,
    malformed: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
}

impl TrafficStats {
    pub fn record_rx(&self, len: usize) {
        self.rx_packets.fetch_add(1, Relaxed);
        self.rx.fetch_add(len as u64, Relaxed);
    }

    pub fn record_tx(&self, len: usize) {
        self.tx_packets.fetch_add(1, Relaxed);
        self.tx.fetch_add(len as u64, Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Relaxed);
    }

    pub fn snapshot(&self) -> TrafficStatus {
        TrafficStatus {
            tx_packets: self.tx_packets.load(Relaxed),
            tx: self.tx.load(Relaxed),
            rx_packets: self.rx_packets.load(Relaxed),
            rx: self.rx.load(Relaxed),
            malformed: self.malformed.load(Relaxed),
            read_errors: self.read_errors.load(Relaxed),
            write_errors: self.write_errors.load(Relaxed),
        }
    }
}

impl std::fmt::Display for TrafficStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "▲ {} ({} pkts) : ▼ {} ({} pkts), malformed {}, read errors {}, write errors {}",
            self.tx, self.tx_packets, self.rx, self.rx_packets, self.malformed, self.read_errors, self.write_errors
        )
    }
}

/// Logs a traffic line at debug level every `interval` until cancelled, and
/// warns when malformed packets keep arriving.
pub(crate) async fn report_traffic(
    stats: std::sync::Arc<TrafficStats>,
    interval: std::time::Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = stats.snapshot();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let status = stats.snapshot();
        if status != last {
            log::debug!("Traffic: {}", status);
        }
        if status.malformed > last.malformed {
            log::warn!("{} malformed packets dropped in the last {:?}", status.malformed - last.malformed, interval);
        }
        last = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = TrafficStats::default();
        stats.record_rx(100);
        stats.record_rx(20);
        stats.record_tx(60);
        stats.record_malformed();
        stats.record_write_error();
        let status = stats.snapshot();
        assert_eq!(status.rx_packets, 2);
        assert_eq!(status.rx, 120);
        assert_eq!(status.tx_packets, 1);
        assert_eq!(status.tx, 60);
        assert_eq!(status.malformed, 1);
        assert_eq!(status.read_errors, 0);
        assert_eq!(status.write_errors, 1);
    }
}
