use thiserror::Error;

/// Errors from the OS-facing network layer
#[derive(Error, Debug)]
pub enum NetStackError {
    #[error("TUN device error: {0}")]
    TunError(String),

    #[error("Interface setup denied: {0}")]
    InterfaceSetup(String),

    #[error("Application cannot be resolved: {0}")]
    UnknownApplication(String),

    #[error("Routing error: {0}")]
    RoutingError(String),

    #[error("Socket protection failed for fd {0}")]
    ProtectFailed(i32),

    #[error("Binding to network {network} failed: {reason}")]
    BindFailed { network: String, reason: String },

    #[error("Network monitor error: {0}")]
    MonitorError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Device not running")]
    NotRunning,
}

/// Why a captured buffer could not be classified
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("Packet truncated: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unsupported IP version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid IPv4 header length: {0} words")]
    InvalidHeader(u8),
}

pub type Result<T> = std::result::Result<T, NetStackError>;
