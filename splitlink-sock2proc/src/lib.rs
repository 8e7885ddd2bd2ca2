//! Socket ownership lookup.
//!
//! Maps an observed flow tuple to the uid that owns the socket (through the
//! kernel connection tables) and a uid to an application package (through the
//! Android package registry, or the owning process on desktop Linux).

use std::net::SocketAddr;
use thiserror::Error;

pub mod packages;
pub mod utils;

pub use packages::PackageRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub exe_path: Option<String>,
    pub cmdline: Option<String>,
}

/// Transport protocol of the socket being looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Owner of a kernel socket entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOwner {
    pub uid: u32,
    pub inode: u64,
}

#[derive(Debug, Error)]
pub enum Sock2ProcError {
    #[error("Process not found")]
    ProcessNotFound,
    #[error("Socket not found in connection table")]
    SocketNotFound,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Invalid socket address")]
    InvalidSocketAddr,
    #[error("Malformed table entry: {0}")]
    Malformed(String),
    #[error("System error: {0}")]
    SystemError(String),
    #[error("Not implemented for this platform")]
    NotImplemented,
}

impl From<std::io::Error> for Sock2ProcError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => Sock2ProcError::PermissionDenied,
            _ => Sock2ProcError::SystemError(e.to_string()),
        }
    }
}

/// Find the uid and inode owning the socket for `local -> remote`
pub fn find_socket_owner(
    protocol: Protocol,
    local: SocketAddr,
    remote: SocketAddr,
) -> Result<SocketOwner, Sock2ProcError> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        platform::linux::find_socket_owner(protocol, local, remote)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = (protocol, local, remote);
        Err(Sock2ProcError::NotImplemented)
    }
}

/// Find the process holding the socket with the given inode
pub fn find_process_by_inode(inode: u64) -> Result<ProcessInfo, Sock2ProcError> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        platform::linux::find_process_by_inode(inode)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = inode;
        Err(Sock2ProcError::NotImplemented)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod platform {
    pub mod linux;
}
