//! SplitLink network layer
//!
//! Everything that touches the OS packet path lives here:
//! - virtual interface lifecycle and whole-packet I/O ([`tun`])
//! - IP/TCP/UDP header classification and reply building ([`packet`])
//! - loop protection and uplink binding of forwarding sockets ([`protect`])
//! - physical network identities and availability monitors ([`network`])
//!
//! # Platform Requirements
//!
//! ## Linux
//! Requires CAP_NET_ADMIN (TUN creation, `ip rule`, `SO_MARK`, `SO_BINDTODEVICE`).
//!
//! ## Android
//! The host's `VpnService` creates the interface and protects sockets; use
//! [`FdTunProvider`] and [`CallbackProtector`].

pub mod error;
#[cfg(unix)]
pub mod fd_tun;
#[cfg(all(target_os = "linux", not(target_os = "android")))]
pub mod linux_tun;
pub mod memory;
pub mod network;
pub mod packet;
pub mod protect;
pub mod tun;

pub use error::{ClassifyError, NetStackError, Result};
#[cfg(unix)]
pub use fd_tun::FdTunProvider;
#[cfg(all(target_os = "linux", not(target_os = "android")))]
pub use linux_tun::LinuxTunProvider;
pub use memory::{MemoryTap, MemoryTunProvider};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use network::SysfsMonitor;
pub use network::{
    EventReceiver, EventSender, ManualMonitor, NetworkEvent, NetworkHandle, NetworkIdentity, NetworkMonitor,
    SubscriptionId,
};
pub use packet::{classify, FlowKey, IpVersion, ParsedPacket, TransportProtocol};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use protect::LinuxSocketProtector;
pub use protect::{CallbackProtector, SocketProtector};
pub use tun::{establish, PacketDevice, RoutePrefix, TunBuilder, TunConfig, TunDevice, TunProvider};
