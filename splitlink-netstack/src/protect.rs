//! Loop protection and uplink binding for forwarding sockets.
//!
//! Every socket the forwarder opens must be exempted from capture before it
//! sends anything, otherwise its own traffic re-enters the virtual interface.

use crate::error::{NetStackError, Result};
use crate::network::NetworkHandle;
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::{debug, warn};

pub trait SocketProtector: Send + Sync {
    /// Exempt `fd` from capture by the virtual interface
    fn protect(&self, fd: RawFd) -> Result<()>;

    /// Route all traffic of `fd` over `network`
    fn bind_to_network(&self, fd: RawFd, network: &NetworkHandle) -> Result<()>;
}

pub type ProtectFn = Arc<dyn Fn(RawFd) -> bool + Send + Sync>;
pub type BindFn = Arc<dyn Fn(RawFd, &NetworkHandle) -> bool + Send + Sync>;

/// Protector backed by host callbacks, e.g. `VpnService.protect(fd)` and
/// `Network.bindSocket(fd)` reached through JNI.
#[derive(Clone)]
pub struct CallbackProtector {
    protect: ProtectFn,
    bind: BindFn,
}

impl CallbackProtector {
    pub fn new<P, B>(protect: P, bind: B) -> Self
    where
        P: Fn(RawFd) -> bool + Send + Sync + 'static,
        B: Fn(RawFd, &NetworkHandle) -> bool + Send + Sync + 'static,
    {
        Self {
            protect: Arc::new(protect),
            bind: Arc::new(bind),
        }
    }
}

impl SocketProtector for CallbackProtector {
    fn protect(&self, fd: RawFd) -> Result<()> {
        if (self.protect)(fd) {
            debug!("Socket fd={} protected", fd);
            Ok(())
        } else {
            warn!("Socket fd={} protection FAILED", fd);
            Err(NetStackError::ProtectFailed(fd))
        }
    }

    fn bind_to_network(&self, fd: RawFd, network: &NetworkHandle) -> Result<()> {
        if (self.bind)(fd, network) {
            debug!("Socket fd={} bound to {}", fd, network);
            Ok(())
        } else {
            Err(NetStackError::BindFailed {
                network: network.to_string(),
                reason: "host refused binding".to_string(),
            })
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::LinuxSocketProtector;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux {
    use super::*;
    use std::io;
    use std::mem;

    /// Linux protector: `SO_MARK` exempts the socket from the capture rule
    /// installed by the TUN provider, `SO_BINDTODEVICE` pins it to the
    /// uplink interface. Both need `CAP_NET_ADMIN`.
    #[derive(Debug, Clone, Copy)]
    pub struct LinuxSocketProtector {
        mark: u32,
    }

    impl LinuxSocketProtector {
        pub fn new(mark: u32) -> Self {
            Self { mark }
        }

        pub fn mark(&self) -> u32 {
            self.mark
        }
    }

    fn set_bind_device(fd: RawFd, interface: &str) -> Result<()> {
        // IFNAMSIZ including the terminating NUL
        if interface.is_empty() || interface.len() > 15 {
            return Err(NetStackError::BindFailed {
                network: interface.to_string(),
                reason: "interface name must be 1..=15 bytes".to_string(),
            });
        }

        let mut ifname = [0u8; 16];
        ifname[..interface.len()].copy_from_slice(interface.as_bytes());

        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                ifname.as_ptr().cast::<libc::c_void>(),
                ifname.len() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(NetStackError::BindFailed {
                network: interface.to_string(),
                reason: io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    impl SocketProtector for LinuxSocketProtector {
        fn protect(&self, fd: RawFd) -> Result<()> {
            let mark = self.mark;
            let ret = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_MARK,
                    std::ptr::addr_of!(mark).cast::<libc::c_void>(),
                    mem::size_of::<u32>() as libc::socklen_t,
                )
            };
            if ret != 0 {
                warn!(
                    "Failed to set SO_MARK {:#x} on fd={}: {}",
                    mark,
                    fd,
                    io::Error::last_os_error()
                );
                return Err(NetStackError::ProtectFailed(fd));
            }
            debug!("Socket fd={} marked {:#x}", fd, mark);
            Ok(())
        }

        fn bind_to_network(&self, fd: RawFd, network: &NetworkHandle) -> Result<()> {
            let interface = network.interface.as_deref().ok_or_else(|| NetStackError::BindFailed {
                network: network.to_string(),
                reason: "handle carries no interface name".to_string(),
            })?;
            set_bind_device(fd, interface)?;
            debug!("Socket fd={} bound to interface {}", fd, interface);
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_interface_name_length() {
            assert!(matches!(
                set_bind_device(-1, "an-interface-name-too-long"),
                Err(NetStackError::BindFailed { .. })
            ));
            assert!(matches!(set_bind_device(-1, ""), Err(NetStackError::BindFailed { .. })));
        }

        #[test]
        fn test_bind_requires_interface() {
            let protector = LinuxSocketProtector::new(0x1ee7);
            assert_eq!(protector.mark(), 0x1ee7);
            assert!(matches!(
                protector.bind_to_network(-1, &NetworkHandle::new(3)),
                Err(NetStackError::BindFailed { .. })
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn test_callback_protector() {
        let seen = Arc::new(AtomicI32::new(-1));
        let seen_clone = seen.clone();
        let protector = CallbackProtector::new(
            move |fd| {
                seen_clone.store(fd, Ordering::SeqCst);
                fd != 13
            },
            |_, network| network.id == 100,
        );

        assert!(protector.protect(12).is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 12);
        assert!(matches!(protector.protect(13), Err(NetStackError::ProtectFailed(13))));

        assert!(protector.bind_to_network(12, &NetworkHandle::new(100)).is_ok());
        assert!(protector.bind_to_network(12, &NetworkHandle::new(101)).is_err());
    }
}
