//! Uplink connection managers.
//!
//! Each slot subscribes to a [`NetworkMonitor`] for its identity. The monitor
//! delivers availability over a channel and the slot's own task applies it, so
//! OS callbacks never touch routing state directly.

use crate::policy::Uplink;
use parking_lot::Mutex;
use splitlink_netstack::{
    NetStackError, NetworkEvent, NetworkHandle, NetworkIdentity, NetworkMonitor, SubscriptionId,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UplinkState {
    #[default]
    Unavailable,
    Available(NetworkHandle),
}

#[derive(Default)]
struct Slot {
    /// Bumped on every start/stop; events from older subscriptions are ignored
    generation: u64,
    state: UplinkState,
}

impl Slot {
    fn apply(&mut self, uplink: Uplink, event: NetworkEvent) {
        match event {
            NetworkEvent::Available(handle) => {
                info!("Uplink {} available on {}", uplink, handle);
                self.state = UplinkState::Available(handle);
            }
            NetworkEvent::Lost(handle) => match &self.state {
                UplinkState::Available(current) if *current == handle => {
                    warn!("Uplink {} lost {}", uplink, handle);
                    self.state = UplinkState::Unavailable;
                }
                _ => debug!("Uplink {} ignoring loss of inactive {}", uplink, handle),
            },
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    identity: NetworkIdentity,
    pump: JoinHandle<()>,
}

pub struct UplinkManager {
    uplink: Uplink,
    monitor: Arc<dyn NetworkMonitor>,
    slot: Arc<Mutex<Slot>>,
    subscription: Mutex<Option<Subscription>>,
}

impl UplinkManager {
    pub fn new(uplink: Uplink, monitor: Arc<dyn NetworkMonitor>) -> Self {
        Self {
            uplink,
            monitor,
            slot: Arc::new(Mutex::new(Slot::default())),
            subscription: Mutex::new(None),
        }
    }

    pub fn uplink(&self) -> Uplink {
        self.uplink
    }

    /// Request networks matching `identity`, replacing any earlier request.
    /// Availability already known to the monitor is applied before returning.
    pub fn start(&self, identity: NetworkIdentity) -> Result<SubscriptionId, NetStackError> {
        self.stop();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = self.monitor.subscribe(&identity, tx)?;

        let generation = {
            let mut slot = self.slot.lock();
            slot.generation += 1;
            while let Ok(event) = rx.try_recv() {
                slot.apply(self.uplink, event);
            }
            slot.generation
        };

        let uplink = self.uplink;
        let slot = self.slot.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut slot = slot.lock();
                if slot.generation != generation {
                    break;
                }
                slot.apply(uplink, event);
            }
            debug!("Uplink {} event pump for {} finished", uplink, id);
        });

        info!("Uplink {} monitoring {} ({})", self.uplink, identity, id);
        *self.subscription.lock() = Some(Subscription { id, identity, pump });
        Ok(id)
    }

    /// Release the network request and forget the handle. Safe to call repeatedly.
    pub fn stop(&self) {
        {
            let mut slot = self.slot.lock();
            slot.generation += 1;
            slot.state = UplinkState::Unavailable;
        }

        let previous = self.subscription.lock().take();
        if let Some(sub) = previous {
            self.monitor.unsubscribe(sub.id);
            sub.pump.abort();
            info!("Uplink {} stopped monitoring {}", self.uplink, sub.identity);
        }
    }

    /// Apply an availability event directly, as a platform bridge would
    pub fn apply(&self, event: NetworkEvent) {
        self.slot.lock().apply(self.uplink, event);
    }

    pub fn state(&self) -> UplinkState {
        self.slot.lock().state.clone()
    }

    /// The network to bind forwarding sockets to, if one is available
    pub fn current_handle(&self) -> Option<NetworkHandle> {
        match &self.slot.lock().state {
            UplinkState::Available(handle) => Some(handle.clone()),
            UplinkState::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.slot.lock().state, UplinkState::Available(_))
    }

    pub fn identity(&self) -> Option<NetworkIdentity> {
        self.subscription.lock().as_ref().map(|s| s.identity.clone())
    }

    pub fn is_started(&self) -> bool {
        self.subscription.lock().is_some()
    }
}

/// Both uplink slots
pub struct Uplinks {
    a: UplinkManager,
    b: UplinkManager,
}

impl Uplinks {
    pub fn new(a: UplinkManager, b: UplinkManager) -> Self {
        Self { a, b }
    }

    pub fn get(&self, uplink: Uplink) -> &UplinkManager {
        match uplink {
            Uplink::A => &self.a,
            Uplink::B => &self.b,
        }
    }

    pub fn stop_all(&self) {
        self.a.stop();
        self.b.stop();
    }
}

impl Drop for UplinkManager {
    fn drop(&mut self) {
        if let Some(sub) = self.subscription.get_mut().take() {
            self.monitor.unsubscribe(sub.id);
            sub.pump.abort();
        }
    }
}
