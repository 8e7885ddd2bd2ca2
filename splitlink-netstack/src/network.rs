//! Physical network identities and availability monitoring.
//!
//! A monitor never touches engine state directly: it pushes
//! [`NetworkEvent`]s into the channel handed over at subscription time and
//! the subscriber applies them on its own task.

use crate::error::{NetStackError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Key carrying the network name in identity maps
pub const NETWORK_NAME_KEY: &str = "ssid";
/// Optional key naming the local interface backing the network
pub const INTERFACE_KEY: &str = "interface";

/// A live network as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkHandle {
    /// Opaque OS id (Android network handle, Linux ifindex)
    pub id: u64,
    pub interface: Option<String>,
}

impl NetworkHandle {
    pub fn new(id: u64) -> Self {
        Self { id, interface: None }
    }

    pub fn with_interface(id: u64, interface: impl Into<String>) -> Self {
        Self {
            id,
            interface: Some(interface.into()),
        }
    }
}

impl fmt::Display for NetworkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.interface {
            Some(name) => write!(f, "net#{}({})", self.id, name),
            None => write!(f, "net#{}", self.id),
        }
    }
}

/// Describes which physical network an uplink should use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    #[serde(rename = "ssid")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

impl NetworkIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interface: None,
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Build from a loose key/value map. Unknown keys are ignored; `None`
    /// when the network name is missing or blank.
    pub fn from_map<K, V>(map: &HashMap<K, V>) -> Option<Self>
    where
        K: std::borrow::Borrow<str> + std::hash::Hash + Eq,
        V: AsRef<str>,
    {
        let name = map.get(NETWORK_NAME_KEY)?.as_ref().trim();
        if name.is_empty() {
            return None;
        }
        let interface = map
            .get(INTERFACE_KEY)
            .map(|v| v.as_ref().trim().to_string())
            .filter(|v| !v.is_empty());
        Some(Self {
            name: name.to_string(),
            interface,
        })
    }

    /// Local interface to watch; defaults to the network name
    pub fn interface_name(&self) -> &str {
        self.interface.as_deref().unwrap_or(&self.name)
    }
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.interface {
            Some(iface) => write!(f, "{} ({})", self.name, iface),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Available(NetworkHandle),
    Lost(NetworkHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Unbounded so that OS callbacks never block on a slow consumer
pub type EventSender = mpsc::UnboundedSender<NetworkEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<NetworkEvent>;

/// Source of availability notifications for networks matching an identity
pub trait NetworkMonitor: Send + Sync {
    fn subscribe(&self, identity: &NetworkIdentity, events: EventSender) -> Result<SubscriptionId>;

    /// Deregister; unknown ids are ignored
    fn unsubscribe(&self, id: SubscriptionId);
}

#[derive(Default)]
struct SubscriptionIds(AtomicU64);

impl SubscriptionIds {
    fn next(&self) -> SubscriptionId {
        SubscriptionId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Monitor driven from outside: a platform bridge (for example the Android
/// `ConnectivityManager` callbacks) or a test announces availability.
#[derive(Default)]
pub struct ManualMonitor {
    ids: SubscriptionIds,
    subscribers: Mutex<HashMap<SubscriptionId, (NetworkIdentity, EventSender)>>,
    available: Mutex<HashMap<String, NetworkHandle>>,
    rejected: Mutex<Vec<String>>,
}

impl ManualMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make future subscriptions for `name` fail
    pub fn reject(&self, name: impl Into<String>) {
        self.rejected.lock().push(name.into());
    }

    pub fn set_available(&self, name: &str, handle: NetworkHandle) {
        self.available.lock().insert(name.to_string(), handle.clone());
        self.broadcast(name, NetworkEvent::Available(handle));
    }

    pub fn set_lost(&self, name: &str) {
        let lost = self.available.lock().remove(name);
        if let Some(handle) = lost {
            self.broadcast(name, NetworkEvent::Lost(handle));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn broadcast(&self, name: &str, event: NetworkEvent) {
        let subscribers = self.subscribers.lock();
        for (id, (identity, tx)) in subscribers.iter() {
            if identity.name == name && tx.send(event.clone()).is_err() {
                debug!("Subscriber {} dropped its receiver", id);
            }
        }
    }
}

impl NetworkMonitor for ManualMonitor {
    fn subscribe(&self, identity: &NetworkIdentity, events: EventSender) -> Result<SubscriptionId> {
        if self.rejected.lock().iter().any(|n| n == &identity.name) {
            return Err(NetStackError::MonitorError(format!(
                "network request for {} rejected",
                identity
            )));
        }

        let id = self.ids.next();
        self.subscribers.lock().insert(id, (identity.clone(), events.clone()));
        let current = self.available.lock().get(&identity.name).cloned();
        if let Some(handle) = current {
            let _ = events.send(NetworkEvent::Available(handle));
        }
        debug!("Registered {} for network {}", id, identity);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if self.subscribers.lock().remove(&id).is_some() {
            debug!("Unregistered {}", id);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use sysfs::SysfsMonitor;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod sysfs {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    const SYS_CLASS_NET: &str = "/sys/class/net";

    /// Polls `/sys/class/net/<if>/{operstate,ifindex}` for the interface
    /// named by each identity.
    pub struct SysfsMonitor {
        root: PathBuf,
        interval: Duration,
        ids: SubscriptionIds,
        tasks: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    }

    impl SysfsMonitor {
        pub fn new(interval: Duration) -> Self {
            Self::with_root(SYS_CLASS_NET, interval)
        }

        pub fn with_root(root: impl Into<PathBuf>, interval: Duration) -> Self {
            Self {
                root: root.into(),
                interval,
                ids: SubscriptionIds::default(),
                tasks: Mutex::new(HashMap::new()),
            }
        }
    }

    /// `Some(ifindex)` while the link is up
    fn link_state(root: &Path, iface: &str) -> Option<u64> {
        let dir = root.join(iface);
        let operstate = std::fs::read_to_string(dir.join("operstate")).ok()?;
        if !matches!(operstate.trim(), "up" | "unknown") {
            return None;
        }
        std::fs::read_to_string(dir.join("ifindex"))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    async fn watch(root: PathBuf, iface: String, interval: Duration, tx: EventSender) {
        let mut current: Option<NetworkHandle> = None;
        let mut ticker = tokio::time::interval(interval);

        while !tx.is_closed() {
            ticker.tick().await;
            let state = link_state(&root, &iface);

            let unchanged = match (&current, state) {
                (Some(handle), Some(index)) => handle.id == index,
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                continue;
            }

            let mut events = Vec::new();
            if let Some(old) = current.take() {
                info!("Interface {} went down", iface);
                events.push(NetworkEvent::Lost(old));
            }
            if let Some(index) = state {
                let handle = NetworkHandle::with_interface(index, iface.as_str());
                info!("Interface {} is up as {}", iface, handle);
                events.push(NetworkEvent::Available(handle.clone()));
                current = Some(handle);
            }

            for event in events {
                if tx.send(event).is_err() {
                    return;
                }
            }
        }
    }

    impl NetworkMonitor for SysfsMonitor {
        fn subscribe(&self, identity: &NetworkIdentity, events: EventSender) -> Result<SubscriptionId> {
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|e| NetStackError::MonitorError(format!("no async runtime: {}", e)))?;

            let id = self.ids.next();
            let iface = identity.interface_name().to_string();
            debug!("Watching interface {} for {} ({})", iface, identity, id);

            let task = runtime.spawn(watch(self.root.clone(), iface, self.interval, events));
            self.tasks.lock().insert(id, task);
            Ok(id)
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            if let Some(task) = self.tasks.lock().remove(&id) {
                task.abort();
                debug!("Stopped watcher {}", id);
            }
        }
    }

    impl Drop for SysfsMonitor {
        fn drop(&mut self) {
            for (_, task) in self.tasks.lock().drain() {
                task.abort();
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn fake_sysfs(tag: &str) -> PathBuf {
            let root = std::env::temp_dir().join(format!("splitlink-sysfs-{}-{}", tag, std::process::id()));
            let _ = std::fs::remove_dir_all(&root);
            std::fs::create_dir_all(root.join("wlan1")).unwrap();
            std::fs::write(root.join("wlan1/ifindex"), "7\n").unwrap();
            root
        }

        #[tokio::test]
        async fn test_sysfs_up_then_down() {
            let root = fake_sysfs("updown");
            std::fs::write(root.join("wlan1/operstate"), "up\n").unwrap();

            let monitor = SysfsMonitor::with_root(&root, Duration::from_millis(10));
            let (tx, mut rx) = mpsc::unbounded_channel();
            let id = monitor
                .subscribe(&NetworkIdentity::new("HomeWifi").with_interface("wlan1"), tx)
                .unwrap();

            let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
            assert_eq!(first, Some(NetworkEvent::Available(NetworkHandle::with_interface(7, "wlan1"))));

            std::fs::write(root.join("wlan1/operstate"), "down\n").unwrap();
            let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
            assert_eq!(second, Some(NetworkEvent::Lost(NetworkHandle::with_interface(7, "wlan1"))));

            monitor.unsubscribe(id);
            let _ = std::fs::remove_dir_all(&root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_map_ignores_unknown_keys() {
        let mut map = HashMap::new();
        map.insert("ssid".to_string(), "Office-5G".to_string());
        map.insert("password".to_string(), "hunter2".to_string());
        map.insert("band".to_string(), "5".to_string());

        let identity = NetworkIdentity::from_map(&map).unwrap();
        assert_eq!(identity, NetworkIdentity::new("Office-5G"));
        assert_eq!(identity.interface_name(), "Office-5G");
    }

    #[test]
    fn test_identity_from_map_requires_name() {
        let mut map: HashMap<&str, &str> = HashMap::new();
        map.insert("interface", "wlan0");
        assert!(NetworkIdentity::from_map(&map).is_none());

        map.insert("ssid", "   ");
        assert!(NetworkIdentity::from_map(&map).is_none());

        map.insert("ssid", "Cafe");
        let identity = NetworkIdentity::from_map(&map).unwrap();
        assert_eq!(identity.interface_name(), "wlan0");
    }

    #[test]
    fn test_manual_monitor_replays_current_network() {
        let monitor = ManualMonitor::new();
        monitor.set_available("Cafe", NetworkHandle::new(42));

        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.subscribe(&NetworkIdentity::new("Cafe"), tx).unwrap();
        assert_eq!(rx.try_recv().unwrap(), NetworkEvent::Available(NetworkHandle::new(42)));

        monitor.set_lost("Cafe");
        assert_eq!(rx.try_recv().unwrap(), NetworkEvent::Lost(NetworkHandle::new(42)));
    }

    #[test]
    fn test_manual_monitor_filters_by_name_and_unsubscribes() {
        let monitor = ManualMonitor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = monitor.subscribe(&NetworkIdentity::new("A"), tx).unwrap();

        monitor.set_available("B", NetworkHandle::new(1));
        assert!(rx.try_recv().is_err());

        monitor.unsubscribe(id);
        monitor.set_available("A", NetworkHandle::new(2));
        assert!(rx.try_recv().is_err());
        assert_eq!(monitor.subscriber_count(), 0);
    }

    #[test]
    fn test_manual_monitor_reject() {
        let monitor = ManualMonitor::new();
        monitor.reject("Blocked");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            monitor.subscribe(&NetworkIdentity::new("Blocked"), tx),
            Err(NetStackError::MonitorError(_))
        ));
    }
}
