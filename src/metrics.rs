//! Process counters for the gateway loops.
//!
//! One [`GatewayMetrics`] instance is created by the gateway and shared by handle; the
//! dashboard and the shutdown log read it through [`GatewayMetrics::snapshot`].
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    beacons_sent: AtomicU64,
    beacons_throttled: AtomicU64,
    emergency_sent: AtomicU64,
    send_failures: AtomicU64,
    packets_seen: AtomicU64,
    packets_rejected: AtomicU64,
    replies_sent: AtomicU64,
    sync_runs: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_beacons_sent(&self) {
        self.beacons_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_beacons_throttled(&self) {
        self.beacons_throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_emergency_sent(&self) {
        self.emergency_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_packets_seen(&self) {
        self.packets_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_packets_rejected(&self) {
        self.packets_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_replies_sent(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sync_runs(&self) {
        self.sync_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            beacons_sent: self.beacons_sent.load(Ordering::Relaxed),
            beacons_throttled: self.beacons_throttled.load(Ordering::Relaxed),
            emergency_sent: self.emergency_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            packets_seen: self.packets_seen.load(Ordering::Relaxed),
            packets_rejected: self.packets_rejected.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            sync_runs: self.sync_runs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub beacons_sent: u64,
    pub beacons_throttled: u64,
    pub emergency_sent: u64,
    pub send_failures: u64,
    pub packets_seen: u64,
    pub packets_rejected: u64,
    pub replies_sent: u64,
    pub sync_runs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_snapshot() {
        let metrics = GatewayMetrics::new();
        assert_eq!(metrics.snapshot(), Snapshot::default());

        metrics.inc_beacons_sent();
        metrics.inc_beacons_sent();
        metrics.inc_beacons_throttled();
        metrics.inc_replies_sent();

        let snap = metrics.snapshot();
        assert_eq!(snap.beacons_sent, 2);
        assert_eq!(snap.beacons_throttled, 1);
        assert_eq!(snap.replies_sent, 1);
        assert_eq!(snap.emergency_sent, 0);
    }
}
