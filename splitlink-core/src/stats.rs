use crate::error::ForwardError;
use crate::policy::Uplink;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide packet counters
#[derive(Debug, Default)]
pub struct EngineStats {
    packets_captured: AtomicU64,
    packets_forwarded: AtomicU64,
    packets_malformed: AtomicU64,
    dropped_unavailable: AtomicU64,
    dropped_unsupported: AtomicU64,
    protect_failures: AtomicU64,
    forward_errors: AtomicU64,
    replies: AtomicU64,
    uplink_a_bytes: AtomicU64,
    uplink_b_bytes: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captured(&self) {
        self.packets_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed(&self) {
        self.packets_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn forwarded(&self, uplink: Uplink, bytes: usize) {
        self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
        let counter = match uplink {
            Uplink::A => &self.uplink_a_bytes,
            Uplink::B => &self.uplink_b_bytes,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn reply(&self) {
        self.replies.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a dropped packet under its failure kind
    pub fn dropped(&self, error: &ForwardError) {
        let counter = match error {
            ForwardError::UplinkUnavailable(_) => &self.dropped_unavailable,
            ForwardError::UnsupportedProtocol(_) | ForwardError::Fragment(_) => &self.dropped_unsupported,
            ForwardError::ProtectFailed(_) => &self.protect_failures,
            ForwardError::Classify(_) => &self.packets_malformed,
            _ => &self.forward_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_captured: self.packets_captured.load(Ordering::Relaxed),
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            packets_malformed: self.packets_malformed.load(Ordering::Relaxed),
            dropped_unavailable: self.dropped_unavailable.load(Ordering::Relaxed),
            dropped_unsupported: self.dropped_unsupported.load(Ordering::Relaxed),
            protect_failures: self.protect_failures.load(Ordering::Relaxed),
            forward_errors: self.forward_errors.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            uplink_a_bytes: self.uplink_a_bytes.load(Ordering::Relaxed),
            uplink_b_bytes: self.uplink_b_bytes.load(Ordering::Relaxed),
            active_flows: 0,
            total_flows: 0,
            evicted_flows: 0,
        }
    }
}

/// Point-in-time engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub packets_captured: u64,
    pub packets_forwarded: u64,
    pub packets_malformed: u64,
    pub dropped_unavailable: u64,
    pub dropped_unsupported: u64,
    pub protect_failures: u64,
    pub forward_errors: u64,
    /// Packets written back into the interface
    pub replies: u64,
    /// Outbound payload bytes per uplink
    pub uplink_a_bytes: u64,
    pub uplink_b_bytes: u64,
    pub active_flows: usize,
    pub total_flows: u64,
    pub evicted_flows: u64,
}

impl StatsSnapshot {
    pub fn dropped(&self) -> u64 {
        self.packets_malformed
            .saturating_add(self.dropped_unavailable)
            .saturating_add(self.dropped_unsupported)
            .saturating_add(self.protect_failures)
            .saturating_add(self.forward_errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitlink_netstack::{ClassifyError, TransportProtocol};

    #[test]
    fn test_drop_accounting() {
        let stats = EngineStats::new();
        stats.dropped(&ForwardError::UplinkUnavailable(Uplink::A));
        stats.dropped(&ForwardError::UnsupportedProtocol(TransportProtocol::Icmp));
        stats.dropped(&ForwardError::Classify(ClassifyError::InvalidHeader(3)));
        stats.dropped(&ForwardError::InterfaceClosed);
        stats.malformed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.dropped_unavailable, 1);
        assert_eq!(snapshot.dropped_unsupported, 1);
        assert_eq!(snapshot.packets_malformed, 2);
        assert_eq!(snapshot.forward_errors, 1);
        assert_eq!(snapshot.dropped(), 5);
    }

    #[test]
    fn test_bytes_per_uplink() {
        let stats = EngineStats::new();
        stats.forwarded(Uplink::A, 100);
        stats.forwarded(Uplink::B, 40);
        stats.forwarded(Uplink::B, 2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.packets_forwarded, 3);
        assert_eq!(snapshot.uplink_a_bytes, 100);
        assert_eq!(snapshot.uplink_b_bytes, 42);
    }
}
