//! Virtual interface whose file descriptor is created by the host.
//!
//! On Android the `VpnService.Builder` owns the interface; the host applies
//! the configuration and the disallowed applications, calls `establish()`,
//! and hands the resulting fd over. The fd is duplicated so the host keeps
//! ownership of the original.

use crate::error::{NetStackError, Result};
use crate::tun::{PacketDevice, TunBuilder, TunConfig, TunProvider};
use async_trait::async_trait;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};

pub type OpenFn = Arc<dyn Fn(&TunConfig, &[String]) -> Result<RawFd> + Send + Sync>;
pub type AppCheckFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct FdTunProvider {
    open: OpenFn,
    is_installed: AppCheckFn,
}

impl FdTunProvider {
    /// `open` receives the configuration and the resolved exclusions and
    /// returns a packet fd; `is_installed` tells whether an application can
    /// be excluded.
    pub fn new<O, C>(open: O, is_installed: C) -> Self
    where
        O: Fn(&TunConfig, &[String]) -> Result<RawFd> + Send + Sync + 'static,
        C: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            open: Arc::new(open),
            is_installed: Arc::new(is_installed),
        }
    }
}

impl TunProvider for FdTunProvider {
    fn builder(&self, config: &TunConfig) -> Result<Box<dyn TunBuilder>> {
        Ok(Box::new(FdTunBuilder {
            provider: self.clone(),
            config: config.clone(),
            excluded: Vec::new(),
        }))
    }
}

struct FdTunBuilder {
    provider: FdTunProvider,
    config: TunConfig,
    excluded: Vec<String>,
}

impl TunBuilder for FdTunBuilder {
    fn add_disallowed_application(&mut self, app: &str) -> Result<()> {
        if !(self.provider.is_installed)(app) {
            return Err(NetStackError::UnknownApplication(app.to_string()));
        }
        self.excluded.push(app.to_string());
        Ok(())
    }

    fn establish(self: Box<Self>) -> Result<Box<dyn PacketDevice>> {
        let fd = (self.provider.open)(&self.config, self.excluded.as_slice())?;
        if fd < 0 {
            return Err(NetStackError::TunError(format!("host returned invalid fd {}", fd)));
        }
        info!("Starting TUN with host fd={}", fd);
        Ok(Box::new(FdDevice::from_host_fd(fd)?))
    }
}

struct FdDevice {
    inner: AsyncFd<File>,
}

impl FdDevice {
    fn from_host_fd(fd: RawFd) -> Result<Self> {
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(NetStackError::TunError(format!(
                "Failed to duplicate TUN fd: {}",
                io::Error::last_os_error()
            )));
        }
        debug!("Duplicated TUN fd: {} -> {}", fd, dup_fd);

        // SAFETY: dup_fd is a fresh descriptor owned by us from here on
        let file = unsafe { File::from_raw_fd(dup_fd) };
        set_nonblocking(dup_fd)?;
        let inner = AsyncFd::new(file)
            .map_err(|e| NetStackError::TunError(format!("Failed to create AsyncFd: {}", e)))?;
        Ok(Self { inner })
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(NetStackError::TunError(format!(
            "Failed to set O_NONBLOCK: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[async_trait]
impl PacketDevice for FdDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(packet)) {
                Ok(result) => return result.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }
}
