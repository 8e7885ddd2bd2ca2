//! Virtual interface lifecycle and whole-packet I/O.
//!
//! The OS-specific part is a [`TunProvider`]; whatever it produces is driven
//! by a reader and a writer task owned by [`TunDevice`], which exposes a pair
//! of channels to the rest of the stack.

use crate::error::{NetStackError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 4096;
const MAX_PACKET: usize = 65535;

/// Destination prefix routed into the interface, e.g. `0.0.0.0/0`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePrefix {
    pub addr: IpAddr,
    pub len: u8,
}

impl RoutePrefix {
    pub fn new(addr: IpAddr, len: u8) -> Self {
        Self { addr, len }
    }

    pub fn max_len(&self) -> u8 {
        if self.addr.is_ipv4() {
            32
        } else {
            128
        }
    }
}

impl Default for RoutePrefix {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

impl FromStr for RoutePrefix {
    type Err = NetStackError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, len) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| NetStackError::Parse(format!("route prefix without length: {}", s)))?;
        let addr: IpAddr = addr.parse()?;
        let len: u8 = len
            .parse()
            .map_err(|e| NetStackError::Parse(format!("invalid prefix length in {}: {}", s, e)))?;
        let prefix = Self::new(addr, len);
        if len > prefix.max_len() {
            return Err(NetStackError::Parse(format!("prefix length out of range: {}", s)));
        }
        Ok(prefix)
    }
}

impl fmt::Display for RoutePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// Virtual interface parameters
#[derive(Debug, Clone, PartialEq)]
pub struct TunConfig {
    pub session_name: String,
    pub address: IpAddr,
    pub prefix_len: u8,
    pub route: RoutePrefix,
    pub dns: IpAddr,
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            session_name: "SplitLink".to_string(),
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            prefix_len: 32,
            route: RoutePrefix::default(),
            dns: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            mtu: 1500,
        }
    }
}

/// Creates virtual interfaces on one platform
pub trait TunProvider: Send + Sync {
    fn builder(&self, config: &TunConfig) -> Result<Box<dyn TunBuilder>>;
}

/// One pending interface
pub trait TunBuilder: Send {
    /// Keep the application's traffic out of the interface.
    /// Fails with [`NetStackError::UnknownApplication`] when it cannot be resolved.
    fn add_disallowed_application(&mut self, app: &str) -> Result<()>;

    fn establish(self: Box<Self>) -> Result<Box<dyn PacketDevice>>;
}

/// An established interface. Dropping it releases the OS resources.
#[async_trait]
pub trait PacketDevice: Send + Sync {
    /// Read one packet; `Ok(0)` means the device is gone
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn send(&self, packet: &[u8]) -> io::Result<()>;
}

/// Establish an interface through `provider`, skipping excluded applications
/// that cannot be resolved, and start its I/O task.
pub fn establish(provider: &dyn TunProvider, config: &TunConfig, excluded: &[String]) -> Result<TunDevice> {
    let mut builder = provider
        .builder(config)
        .map_err(|e| NetStackError::InterfaceSetup(e.to_string()))?;

    for app in excluded {
        match builder.add_disallowed_application(app) {
            Ok(()) => debug!("Excluded {} from {}", app, config.session_name),
            Err(e) => warn!("Skipping excluded application {}: {}", app, e),
        }
    }

    let device = builder
        .establish()
        .map_err(|e| NetStackError::InterfaceSetup(e.to_string()))?;
    info!(
        "Virtual interface {} established: {}/{} route {} dns {} mtu {}",
        config.session_name, config.address, config.prefix_len, config.route, config.dns, config.mtu
    );
    Ok(TunDevice::spawn(config.clone(), device))
}

/// Running interface wrapper
pub struct TunDevice {
    config: TunConfig,
    tx: mpsc::Sender<BytesMut>,
    rx: Option<mpsc::Receiver<BytesMut>>,
    running: Arc<AtomicBool>,
    /// Flipped to `true` to stop both I/O tasks
    shutdown: Arc<watch::Sender<bool>>,
    torn_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TunDevice {
    /// Reading and writing run as separate tasks so a stack that is slow to
    /// drain inbound packets never holds up outbound ones.
    fn spawn(config: TunConfig, device: Box<dyn PacketDevice>) -> Self {
        let device: Arc<dyn PacketDevice> = Arc::from(device);
        let (tx_to_tun, rx_from_stack) = mpsc::channel::<BytesMut>(CHANNEL_CAPACITY);
        let (tx_to_stack, rx_from_tun) = mpsc::channel::<BytesMut>(CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let running = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            config.session_name.clone(),
            device.clone(),
            tx_to_stack,
            shutdown.clone(),
            running.clone(),
        ));
        let writer = tokio::spawn(write_loop(device, rx_from_stack, shutdown.subscribe()));

        Self {
            config,
            tx: tx_to_tun,
            rx: Some(rx_from_tun),
            running,
            shutdown,
            torn_down: AtomicBool::new(false),
            tasks: Mutex::new(vec![reader, writer]),
        }
    }

    pub fn config(&self) -> &TunConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Channel for packets to be written into the interface
    pub fn sender(&self) -> mpsc::Sender<BytesMut> {
        self.tx.clone()
    }

    /// Packets read from the interface. Yields `None` once torn down.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<BytesMut>> {
        self.rx.take()
    }

    pub async fn send(&self, packet: BytesMut) -> Result<()> {
        if !self.is_running() {
            return Err(NetStackError::NotRunning);
        }
        self.tx.send(packet).await.map_err(|_| NetStackError::ChannelClosed)
    }

    /// Stop the I/O tasks and release the device. Safe to call repeatedly.
    /// The device is released even when a task ended abnormally; that is
    /// reported as the error.
    pub async fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Tearing down virtual interface {}", self.config.session_name);
        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut failure = None;
        for task in tasks {
            if let Err(e) = task.await {
                failure = Some(NetStackError::TunError(format!("I/O task ended abnormally: {}", e)));
            }
        }
        self.running.store(false, Ordering::Relaxed);
        failure.map_or(Ok(()), Err)
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        if !self.torn_down.swap(true, Ordering::SeqCst) {
            warn!("Virtual interface {} dropped without teardown", self.config.session_name);
            self.shutdown.send_replace(true);
        }
    }
}

async fn read_loop(
    name: String,
    device: Arc<dyn PacketDevice>,
    tx_to_stack: mpsc::Sender<BytesMut>,
    shutdown: Arc<watch::Sender<bool>>,
    running: Arc<AtomicBool>,
) {
    let mut stop = shutdown.subscribe();
    let mut read_buf = vec![0u8; MAX_PACKET];

    loop {
        let n = tokio::select! {
            result = device.recv(&mut read_buf) => match result {
                Ok(0) => {
                    debug!("Virtual interface {} closed", name);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    error!("TUN read error: {}", e);
                    break;
                }
            },
            _ = stop.changed() => break,
        };

        let packet = BytesMut::from(&read_buf[..n]);
        tokio::select! {
            sent = tx_to_stack.send(packet) => {
                if sent.is_err() {
                    debug!("Stack receiver dropped");
                    break;
                }
            }
            _ = stop.changed() => break,
        }
    }

    running.store(false, Ordering::Relaxed);
    // The device is gone or unwanted either way; take the writer down too
    shutdown.send_replace(true);
    info!("TUN reader for {} stopped", name);
}

async fn write_loop(
    device: Arc<dyn PacketDevice>,
    mut rx_from_stack: mpsc::Receiver<BytesMut>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            packet = rx_from_stack.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = device.send(&packet).await {
                        warn!("TUN write error: {}", e);
                    }
                }
                None => break,
            },
            _ = stop.changed() => break,
        }
    }
    debug!("TUN writer stopped");
}
