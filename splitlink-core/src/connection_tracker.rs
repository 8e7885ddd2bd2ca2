//! Sticky flow table.
//!
//! A flow is assigned an uplink once, on its first packet, and keeps it for
//! its whole life. Later policy changes only update the record's preference
//! field; sockets are never migrated.

use crate::policy::{ApplicationId, ApplicationSet, RoutingPolicy, Uplink};
use dashmap::DashMap;
use splitlink_netstack::FlowKey;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// One tracked flow
#[derive(Debug)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub app: ApplicationId,
    /// Fixed at creation
    pub uplink: Uplink,
    prefers_uplink_a: AtomicBool,
    created: Instant,
    /// Milliseconds since `created`
    last_seen: AtomicU64,
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
}

impl FlowRecord {
    fn new(key: FlowKey, app: ApplicationId, uplink: Uplink) -> Self {
        Self {
            key,
            app,
            uplink,
            prefers_uplink_a: AtomicBool::new(uplink == Uplink::A),
            created: Instant::now(),
            last_seen: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            packets_in: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
        }
    }

    /// Uplink the current application set would pick for a new flow of this
    /// application. May differ from [`FlowRecord::uplink`].
    pub fn preferred_uplink(&self) -> Uplink {
        if self.prefers_uplink_a.load(Ordering::Relaxed) {
            Uplink::A
        } else {
            Uplink::B
        }
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_seen.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Packet captured from the interface
    pub fn record_outbound(&self, bytes: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Reply written back into the interface
    pub fn record_inbound(&self, bytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last_seen)
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            key: self.key,
            app: self.app.clone(),
            uplink: self.uplink,
            preferred_uplink: self.preferred_uplink(),
            age: self.created.elapsed(),
            idle: self.idle_for(),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a [`FlowRecord`]
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSnapshot {
    pub key: FlowKey,
    pub app: ApplicationId,
    pub uplink: Uplink,
    pub preferred_uplink: Uplink,
    pub age: Duration,
    pub idle: Duration,
    pub packets_out: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub bytes_in: u64,
}

/// Flow table owned by one engine
#[derive(Default)]
pub struct ConnectionTracker {
    flows: DashMap<FlowKey, Arc<FlowRecord>>,
    total_flows: AtomicU64,
    evicted_flows: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the record for `key`. Creation and lookup are a single
    /// atomic step, so concurrent callers agree on the uplink.
    pub fn assign_record(&self, key: FlowKey, app: ApplicationId, policy: &RoutingPolicy) -> Arc<FlowRecord> {
        self.flows
            .entry(key)
            .or_insert_with(|| {
                let uplink = policy.uplink_for(&app);
                self.total_flows.fetch_add(1, Ordering::Relaxed);
                debug!("New flow {} ({}) -> Uplink {}", key, app, uplink);
                Arc::new(FlowRecord::new(key, app, uplink))
            })
            .value()
            .clone()
    }

    /// Uplink for `key`, assigning one from `policy` if the flow is new
    pub fn assign(&self, key: FlowKey, app: ApplicationId, policy: &RoutingPolicy) -> Uplink {
        self.assign_record(key, app, policy).uplink
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<FlowRecord>> {
        self.flows.get(key).map(|r| Arc::clone(r.value()))
    }

    /// Mark outbound activity; returns false for unknown flows
    pub fn touch(&self, key: &FlowKey, bytes: usize) -> bool {
        match self.flows.get(key) {
            Some(record) => {
                record.record_outbound(bytes);
                true
            }
            None => false,
        }
    }

    /// Refresh every record's preference field. Assigned uplinks do not change.
    /// Returns how many records changed preference.
    pub fn update_application_set(&self, apps: &ApplicationSet) -> usize {
        let mut changed = 0;
        for record in self.flows.iter() {
            let prefers_a = apps.contains(&record.app);
            if record.prefers_uplink_a.swap(prefers_a, Ordering::Relaxed) != prefers_a {
                changed += 1;
            }
        }
        debug!("Application set updated, {} flow preferences changed", changed);
        changed
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<FlowRecord>> {
        self.flows.remove(key).map(|(_, record)| record)
    }

    /// Remove flows idle for longer than `ttl`
    pub fn evict_idle(&self, ttl: Duration) -> Vec<FlowKey> {
        let candidates: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|r| r.idle_for() > ttl)
            .map(|r| *r.key())
            .collect();

        // A packet may have arrived between the scan and the removal
        let evicted: Vec<FlowKey> = candidates
            .into_iter()
            .filter(|key| self.flows.remove_if(key, |_, r| r.idle_for() > ttl).is_some())
            .collect();

        if !evicted.is_empty() {
            self.evicted_flows.fetch_add(evicted.len() as u64, Ordering::Relaxed);
            trace!("Evicted {} idle flows", evicted.len());
        }
        evicted
    }

    pub fn clear(&self) {
        let count = self.flows.len();
        self.flows.clear();
        debug!("Cleared {} flows", count);
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Flows created since construction
    pub fn total_flows(&self) -> u64 {
        self.total_flows.load(Ordering::Relaxed)
    }

    pub fn evicted_flows(&self) -> u64 {
        self.evicted_flows.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<FlowSnapshot> {
        self.flows.iter().map(|r| r.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitlink_netstack::{NetworkIdentity, TransportProtocol};

    fn policy(apps: &[&str]) -> RoutingPolicy {
        RoutingPolicy::new(
            ApplicationSet::new(apps.iter().copied()),
            NetworkIdentity::new("HomeWifi"),
            NetworkIdentity::new("Hotspot"),
        )
    }

    fn key(src_port: u16) -> FlowKey {
        FlowKey::new(
            format!("10.0.0.2:{}", src_port).parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
            TransportProtocol::Tcp,
        )
    }

    #[test]
    fn test_assign_by_policy() {
        let tracker = ConnectionTracker::new();
        let policy = policy(&["com.chrome"]);

        assert_eq!(tracker.assign(key(1), ApplicationId::package("com.chrome"), &policy), Uplink::A);
        assert_eq!(tracker.assign(key(2), ApplicationId::package("org.firefox"), &policy), Uplink::B);
        assert_eq!(tracker.assign(key(3), ApplicationId::Unknown, &policy), Uplink::B);
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.total_flows(), 3);
    }

    #[test]
    fn test_assignment_is_sticky() {
        let tracker = ConnectionTracker::new();
        let chrome = ApplicationId::package("com.chrome");

        assert_eq!(tracker.assign(key(1), chrome.clone(), &policy(&["com.chrome"])), Uplink::A);
        tracker.update_application_set(&ApplicationSet::new(["org.firefox"]));

        // Existing flow keeps A even under the new policy
        assert_eq!(tracker.assign(key(1), chrome.clone(), &policy(&["org.firefox"])), Uplink::A);
        let record = tracker.get(&key(1)).unwrap();
        assert_eq!(record.uplink, Uplink::A);
        assert_eq!(record.preferred_uplink(), Uplink::B);

        // A new flow of the same app follows the new policy
        assert_eq!(tracker.assign(key(2), chrome, &policy(&["org.firefox"])), Uplink::B);
        assert_eq!(tracker.total_flows(), 2);
    }

    #[test]
    fn test_update_application_set_counts_changes() {
        let tracker = ConnectionTracker::new();
        let policy = policy(&["com.chrome"]);
        tracker.assign(key(1), ApplicationId::package("com.chrome"), &policy);
        tracker.assign(key(2), ApplicationId::package("org.firefox"), &policy);

        assert_eq!(tracker.update_application_set(&ApplicationSet::new(["com.chrome"])), 0);
        assert_eq!(tracker.update_application_set(&ApplicationSet::new(["org.firefox"])), 2);
    }

    #[test]
    fn test_touch_and_counters() {
        let tracker = ConnectionTracker::new();
        assert!(!tracker.touch(&key(1), 100));

        let record = tracker.assign_record(key(1), ApplicationId::Unknown, &policy(&[]));
        assert!(tracker.touch(&key(1), 100));
        record.record_inbound(40);

        let snapshot = tracker.get(&key(1)).unwrap().snapshot();
        assert_eq!(snapshot.packets_out, 1);
        assert_eq!(snapshot.bytes_out, 100);
        assert_eq!(snapshot.packets_in, 1);
        assert_eq!(snapshot.bytes_in, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle() {
        let tracker = ConnectionTracker::new();
        let policy = policy(&[]);
        tracker.assign(key(1), ApplicationId::Unknown, &policy);
        tracker.assign(key(2), ApplicationId::Unknown, &policy);

        tokio::time::advance(Duration::from_secs(300)).await;
        tracker.touch(&key(2), 10);
        tokio::time::advance(Duration::from_secs(301)).await;

        let evicted = tracker.evict_idle(Duration::from_secs(600));
        assert_eq!(evicted, vec![key(1)]);
        assert!(tracker.get(&key(1)).is_none());
        assert!(tracker.get(&key(2)).is_some());
        assert_eq!(tracker.evicted_flows(), 1);
    }

    #[test]
    fn test_clear() {
        let tracker = ConnectionTracker::new();
        tracker.assign(key(1), ApplicationId::Unknown, &policy(&[]));
        tracker.clear();
        assert!(tracker.is_empty());
        assert!(tracker.remove(&key(1)).is_none());
    }
}
