//! In-process virtual interface backed by channels.
//!
//! Used by embedders that own the real packet path themselves and by tests:
//! the [`MemoryTap`] is the "outside" of the interface.

use crate::error::{NetStackError, Result};
use crate::tun::{PacketDevice, TunBuilder, TunConfig, TunProvider};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct ProviderState {
    failure: Option<String>,
    unknown: HashSet<String>,
    excluded: Vec<String>,
    tap: Option<MemoryTap>,
    configs: Vec<TunConfig>,
}

#[derive(Clone, Default)]
pub struct MemoryTunProvider {
    state: Arc<Mutex<ProviderState>>,
    established: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
}

impl MemoryTunProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent establish fail as if the OS refused
    pub fn fail_setup(&self, reason: impl Into<String>) {
        self.state.lock().failure = Some(reason.into());
    }

    pub fn clear_failure(&self) {
        self.state.lock().failure = None;
    }

    /// Treat `app` as not installed
    pub fn mark_unknown(&self, app: impl Into<String>) {
        self.state.lock().unknown.insert(app.into());
    }

    /// Applications excluded from the most recent interface
    pub fn excluded(&self) -> Vec<String> {
        self.state.lock().excluded.clone()
    }

    pub fn last_config(&self) -> Option<TunConfig> {
        self.state.lock().configs.last().cloned()
    }

    /// Outside end of the most recent interface
    pub fn tap(&self) -> Option<MemoryTap> {
        self.state.lock().tap.clone()
    }

    /// Interfaces established since creation
    pub fn established_count(&self) -> usize {
        self.established.load(Ordering::SeqCst)
    }

    /// Interfaces currently alive
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl TunProvider for MemoryTunProvider {
    fn builder(&self, config: &TunConfig) -> Result<Box<dyn TunBuilder>> {
        if let Some(reason) = &self.state.lock().failure {
            return Err(NetStackError::TunError(reason.clone()));
        }
        Ok(Box::new(MemoryBuilder {
            provider: self.clone(),
            config: config.clone(),
            excluded: Vec::new(),
        }))
    }
}

struct MemoryBuilder {
    provider: MemoryTunProvider,
    config: TunConfig,
    excluded: Vec<String>,
}

impl TunBuilder for MemoryBuilder {
    fn add_disallowed_application(&mut self, app: &str) -> Result<()> {
        if self.provider.state.lock().unknown.contains(app) {
            return Err(NetStackError::UnknownApplication(app.to_string()));
        }
        self.excluded.push(app.to_string());
        Ok(())
    }

    fn establish(self: Box<Self>) -> Result<Box<dyn PacketDevice>> {
        let MemoryBuilder {
            provider,
            config,
            excluded,
        } = *self;
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();

        {
            let mut state = provider.state.lock();
            if let Some(reason) = &state.failure {
                return Err(NetStackError::TunError(reason.clone()));
            }
            state.excluded = excluded;
            state.configs.push(config);
            state.tap = Some(MemoryTap {
                inject: inject_tx,
                written: Arc::new(tokio::sync::Mutex::new(written_rx)),
            });
        }

        provider.established.fetch_add(1, Ordering::SeqCst);
        provider.active.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryDevice {
            inbound: tokio::sync::Mutex::new(inject_rx),
            outbound: written_tx,
            active: provider.active.clone(),
        }))
    }
}

/// Outside end of a memory interface
#[derive(Clone)]
pub struct MemoryTap {
    inject: mpsc::UnboundedSender<Vec<u8>>,
    written: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl MemoryTap {
    /// Deliver a packet as if an application sent it. `false` once the
    /// interface is gone.
    pub fn inject(&self, packet: Vec<u8>) -> bool {
        self.inject.send(packet).is_ok()
    }

    /// Next packet the stack wrote into the interface
    pub async fn next_written(&self) -> Option<Vec<u8>> {
        self.written.lock().await.recv().await
    }
}

struct MemoryDevice {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    active: Arc<AtomicUsize>,
}

#[async_trait]
impl PacketDevice for MemoryDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self.inbound.lock().await.recv().await;
        match packet {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tap closed"))
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
