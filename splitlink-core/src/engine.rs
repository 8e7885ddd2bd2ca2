//! Engine lifecycle and the capture loop.
//!
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`. Control operations
//! are serialized; the capture loop runs on its own task and reads the routing
//! policy lock-free for every new flow.

use crate::classifier::OwnerResolver;
use crate::config::EngineConfig;
use crate::connection_tracker::{ConnectionTracker, FlowSnapshot};
use crate::error::{EngineError, Error, ForwardError};
use crate::forwarder::Forwarder;
use crate::logging;
use crate::policy::{ApplicationSet, PolicyStore, RoutingPolicy, Uplink};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::uplink::{UplinkManager, UplinkState, Uplinks};
use bytes::BytesMut;
use parking_lot::RwLock;
use splitlink_netstack::{
    classify, FlowKey, NetStackError, NetworkIdentity, NetworkMonitor, SocketProtector, TunDevice, TunProvider,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Everything that exists only while an interface is up
struct Session {
    device: TunDevice,
    forwarder: Arc<Forwarder>,
    shutdown: watch::Sender<bool>,
    capture: JoinHandle<()>,
    cleanup: Option<JoinHandle<()>>,
}

pub struct Engine {
    config: EngineConfig,
    provider: Arc<dyn TunProvider>,
    protector: Arc<dyn SocketProtector>,
    resolver: Arc<dyn OwnerResolver>,
    uplinks: Arc<Uplinks>,
    policy: Arc<PolicyStore>,
    tracker: Arc<ConnectionTracker>,
    stats: Arc<EngineStats>,
    state: RwLock<EngineState>,
    running: Arc<AtomicBool>,
    /// Serializes control operations; holds the live session
    session: Mutex<Option<Session>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn TunProvider>,
        monitor: Arc<dyn NetworkMonitor>,
        protector: Arc<dyn SocketProtector>,
        resolver: Arc<dyn OwnerResolver>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let uplinks = Uplinks::new(
            UplinkManager::new(Uplink::A, monitor.clone()),
            UplinkManager::new(Uplink::B, monitor),
        );
        let policy = RoutingPolicy::new(
            ApplicationSet::default(),
            NetworkIdentity::new(""),
            NetworkIdentity::new(""),
        );

        Ok(Self {
            config,
            provider,
            protector,
            resolver,
            uplinks: Arc::new(uplinks),
            policy: Arc::new(PolicyStore::new(policy)),
            tracker: Arc::new(ConnectionTracker::new()),
            stats: Arc::new(EngineStats::new()),
            state: RwLock::new(EngineState::Stopped),
            running: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
        })
    }

    /// Start from the loose identity maps a host passes in. Each map needs an
    /// `ssid`; other keys besides `interface` are ignored.
    pub async fn start<I, S>(
        &self,
        apps: I,
        uplink_a: &HashMap<String, String>,
        uplink_b: &HashMap<String, String>,
    ) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let identity_a = NetworkIdentity::from_map(uplink_a).ok_or(EngineError::MissingArgument("uplink_a.ssid"))?;
        let identity_b = NetworkIdentity::from_map(uplink_b).ok_or(EngineError::MissingArgument("uplink_b.ssid"))?;
        self.start_with(ApplicationSet::new(apps), identity_a, identity_b).await
    }

    pub async fn start_with(
        &self,
        apps: ApplicationSet,
        uplink_a: NetworkIdentity,
        uplink_b: NetworkIdentity,
    ) -> Result<(), EngineError> {
        let mut session = self.session.lock().await;
        if self.state() != EngineState::Stopped {
            return Err(EngineError::AlreadyRunning);
        }

        let _perf = logging::time_operation("Engine start");
        self.set_state(EngineState::Starting);
        info!(
            "Starting engine: {} apps on Uplink A ({}), everything else on Uplink B ({})",
            apps.len(),
            uplink_a,
            uplink_b
        );
        // The session reads its exclusions from the stored policy
        let previous = self.policy.snapshot();
        self.policy.store(RoutingPolicy::new(apps, uplink_a.clone(), uplink_b.clone()));

        let started = match self.open_session() {
            Ok(started) => started,
            Err(e) => {
                warn!("Engine start failed: {}", e);
                self.policy.store((*previous).clone());
                self.set_state(EngineState::Stopped);
                return Err(e);
            }
        };

        for (uplink, identity) in [(Uplink::A, uplink_a), (Uplink::B, uplink_b)] {
            if let Err(source) = self.uplinks.get(uplink).start(identity) {
                warn!("Uplink {} registration failed, rolling back: {}", uplink, source);
                self.close_session(started).await;
                self.uplinks.stop_all();
                self.policy.store((*previous).clone());
                self.set_state(EngineState::Stopped);
                return Err(EngineError::UplinkSetup { uplink, source });
            }
        }

        *session = Some(started);
        self.running.store(true, Ordering::SeqCst);
        self.set_state(EngineState::Running);
        logging::log_success("Engine started", None);
        Ok(())
    }

    /// Stop capturing and release everything. Safe to call in any state.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        let Some(current) = session.take() else {
            debug!("Engine already stopped");
            return;
        };

        let _perf = logging::time_operation("Engine stop");
        self.set_state(EngineState::Stopping);
        self.running.store(false, Ordering::SeqCst);

        self.close_session(current).await;
        self.uplinks.stop_all();
        self.tracker.clear();

        self.set_state(EngineState::Stopped);
        logging::log_success("Engine stopped", None);
    }

    /// Replace the Uplink A application set. Existing flows keep their uplink.
    pub async fn update_applications<I, S>(&self, apps: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut session = self.session.lock().await;
        if session.is_none() || self.state() != EngineState::Running {
            return Err(EngineError::NotRunning);
        }

        let apps = ApplicationSet::new(apps);
        info!("Updating Uplink A applications: {:?}", apps.sorted());
        self.policy.update(|p| RoutingPolicy {
            uplink_a_apps: apps.clone(),
            ..p.clone()
        });
        self.tracker.update_application_set(&apps);

        if self.config.interface.rebuild_on_app_change {
            info!("Rebuilding virtual interface for the new exclusion list");
            if let Some(old) = session.take() {
                self.close_session(old).await;
            }
            self.tracker.clear();
            match self.open_session() {
                Ok(rebuilt) => *session = Some(rebuilt),
                Err(e) => {
                    warn!("Interface rebuild failed, stopping: {}", e);
                    self.running.store(false, Ordering::SeqCst);
                    self.uplinks.stop_all();
                    self.set_state(EngineState::Stopped);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub async fn update_uplink_a_identity(&self, identity: &HashMap<String, String>) -> Result<(), EngineError> {
        self.update_identity(Uplink::A, identity, "uplink_a.ssid").await
    }

    pub async fn update_uplink_b_identity(&self, identity: &HashMap<String, String>) -> Result<(), EngineError> {
        self.update_identity(Uplink::B, identity, "uplink_b.ssid").await
    }

    async fn update_identity(
        &self,
        uplink: Uplink,
        map: &HashMap<String, String>,
        argument: &'static str,
    ) -> Result<(), EngineError> {
        let session = self.session.lock().await;
        if session.is_none() || self.state() != EngineState::Running {
            return Err(EngineError::NotRunning);
        }
        let identity = NetworkIdentity::from_map(map).ok_or(EngineError::MissingArgument(argument))?;

        info!("Uplink {} identity -> {}", uplink, identity);
        let manager = self.uplinks.get(uplink);
        if let Err(source) = manager.start(identity.clone()) {
            let previous = self.policy.load().identity(uplink).clone();
            warn!("Uplink {} registration for {} failed, keeping {}: {}", uplink, identity, previous, source);
            if let Err(e) = manager.start(previous) {
                warn!("Uplink {} could not resubscribe: {}", uplink, e);
            }
            return Err(EngineError::UplinkSetup { uplink, source });
        }

        self.policy.update(|p| {
            let mut next = p.clone();
            match uplink {
                Uplink::A => next.uplink_a = identity.clone(),
                Uplink::B => next.uplink_b = identity.clone(),
            }
            next
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    fn set_state(&self, next: EngineState) {
        let mut state = self.state.write();
        debug!("Engine {} -> {}", *state, next);
        *state = next;
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.active_flows = self.tracker.len();
        snapshot.total_flows = self.tracker.total_flows();
        snapshot.evicted_flows = self.tracker.evicted_flows();
        snapshot
    }

    pub fn flow(&self, key: &FlowKey) -> Option<FlowSnapshot> {
        self.tracker.get(key).map(|r| r.snapshot())
    }

    pub fn flows(&self) -> Vec<FlowSnapshot> {
        self.tracker.snapshot()
    }

    pub fn policy(&self) -> Arc<RoutingPolicy> {
        self.policy.snapshot()
    }

    pub fn uplink_state(&self, uplink: Uplink) -> UplinkState {
        self.uplinks.get(uplink).state()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Establish the interface and spawn the capture and cleanup tasks
    fn open_session(&self) -> Result<Session, EngineError> {
        let tun_config = self
            .config
            .interface
            .tun_config()
            .map_err(|e| EngineError::InterfaceSetup(NetStackError::InterfaceSetup(e.to_string())))?;
        let policy = self.policy.snapshot();
        let excluded = self
            .config
            .interface
            .excluded_applications(policy.uplink_a_apps.iter());

        let mut device = splitlink_netstack::establish(self.provider.as_ref(), &tun_config, &excluded)
            .map_err(EngineError::InterfaceSetup)?;
        let packets = device
            .take_receiver()
            .ok_or_else(|| EngineError::InterfaceSetup(NetStackError::ChannelClosed))?;

        let forwarder = Arc::new(Forwarder::new(
            self.config.forwarder.clone(),
            tun_config.mtu,
            self.protector.clone(),
            self.uplinks.clone(),
            device.sender(),
            self.tracker.clone(),
            self.stats.clone(),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let capture = CaptureLoop {
            packets,
            forwarder: forwarder.clone(),
            resolver: self.resolver.clone(),
            policy: self.policy.clone(),
            tracker: self.tracker.clone(),
            stats: self.stats.clone(),
            running: self.running.clone(),
            shutdown: shutdown_rx.clone(),
        };
        let capture = tokio::spawn(capture.run());

        let cleanup = self.config.flows.idle_timeout().map(|ttl| {
            tokio::spawn(cleanup_idle_flows(
                self.tracker.clone(),
                forwarder.clone(),
                ttl,
                self.config.flows.cleanup_interval(),
                shutdown_rx,
            ))
        });

        Ok(Session {
            device,
            forwarder,
            shutdown,
            capture,
            cleanup,
        })
    }

    async fn close_session(&self, session: Session) {
        let Session {
            device,
            forwarder,
            shutdown,
            capture,
            cleanup,
        } = session;

        let _ = shutdown.send(true);
        if let Err(e) = capture.await {
            warn!("Capture loop ended abnormally: {}", e);
        }
        if let Some(cleanup) = cleanup {
            let _ = cleanup.await;
        }
        forwarder.close_all();
        if let Err(e) = device.teardown().await {
            let err = Error::resource(e.to_string(), device.config().session_name.clone());
            logging::log_error(&err, Some("Interface teardown"));
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            let _ = session.shutdown.send(true);
            session.capture.abort();
            if let Some(cleanup) = session.cleanup {
                cleanup.abort();
            }
            session.forwarder.close_all();
        }
    }
}

/// Reads captured packets one at a time and hands them to the forwarder
struct CaptureLoop {
    packets: mpsc::Receiver<BytesMut>,
    forwarder: Arc<Forwarder>,
    resolver: Arc<dyn OwnerResolver>,
    policy: Arc<PolicyStore>,
    tracker: Arc<ConnectionTracker>,
    stats: Arc<EngineStats>,
    running: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl CaptureLoop {
    async fn run(mut self) {
        debug!("Capture loop started");
        loop {
            let packet = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                packet = self.packets.recv() => match packet {
                    Some(packet) => packet,
                    None => {
                        debug!("Virtual interface closed");
                        break;
                    }
                },
            };

            self.process(&packet).await;

            if !self.running.load(Ordering::Relaxed) || *self.shutdown.borrow() {
                break;
            }
        }
        debug!("Capture loop finished");
    }

    async fn process(&self, raw: &[u8]) {
        self.stats.captured();

        let parsed = match classify(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!("Dropping malformed packet: {}", e);
                self.stats.malformed();
                return;
            }
        };

        // Without ports it would be pinned as a flow of its own
        if parsed.trailing_fragment {
            trace!("Dropping trailing {} fragment", parsed.protocol);
            self.stats.dropped(&ForwardError::Fragment(parsed.protocol));
            return;
        }

        let key = parsed.flow_key();
        let record = match self.tracker.get(&key) {
            Some(record) => record,
            None => {
                // Owner lookup only for the first packet of a flow
                let app = self.resolver.resolve(&parsed);
                let policy = self.policy.load();
                self.tracker.assign_record(key, app, &policy)
            }
        };
        record.record_outbound(raw.len());

        match self.forwarder.forward(&parsed, raw, record.uplink).await {
            Ok(()) => self.stats.forwarded(record.uplink, raw.len()),
            Err(e) => {
                match &e {
                    ForwardError::UplinkUnavailable(_) | ForwardError::UnsupportedProtocol(_) => {
                        trace!("Dropped {}: {}", key, e)
                    }
                    _ => debug!("Dropped {}: {}", key, e),
                }
                self.stats.dropped(&e);
            }
        }
    }
}

async fn cleanup_idle_flows(
    tracker: Arc<ConnectionTracker>,
    forwarder: Arc<Forwarder>,
    ttl: Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let evicted = tracker.evict_idle(ttl);
                for key in &evicted {
                    forwarder.close_flow(key);
                }
                if !evicted.is_empty() {
                    debug!("Evicted {} flows idle for over {:?}", evicted.len(), ttl);
                }
            }
        }
    }
}
