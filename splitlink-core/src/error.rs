use crate::policy::Uplink;
use splitlink_netstack::{ClassifyError, NetStackError, TransportProtocol};
use thiserror::Error;

/// SplitLink error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Setup error: {message}")]
    Setup {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Releasing an OS resource failed during teardown. Logged, never
    /// returned from `stop`.
    #[error("Resource error: {message} ({resource})")]
    Resource { message: String, resource: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new configuration error with source
    pub fn config_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn setup_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Setup {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Failure while releasing an OS resource
    pub fn resource<S: Into<String>, R: Into<String>>(message: S, resource: R) -> Self {
        Self::Resource {
            message: message.into(),
            resource: resource.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get error code/category for external use
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG",
            Self::Setup { .. } => "SETUP",
            Self::Resource { .. } => "RESOURCE",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Resource { .. } => true,
            Self::Config { .. } | Self::Setup { .. } | Self::Internal { .. } => false,
        }
    }
}

/// Errors surfaced by the engine control operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Engine is not running")]
    NotRunning,

    #[error("Virtual interface setup failed: {0}")]
    InterfaceSetup(#[source] NetStackError),

    #[error("Uplink {uplink} registration failed: {source}")]
    UplinkSetup {
        uplink: Uplink,
        #[source]
        source: NetStackError,
    },
}

impl EngineError {
    /// Stable code for host bridges
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingArgument(_) => "MISSING_ARGUMENT",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::NotRunning => "NOT_RUNNING",
            Self::InterfaceSetup(_) => "INTERFACE_SETUP",
            Self::UplinkSetup { .. } => "UPLINK_SETUP",
        }
    }
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::MissingArgument(_) => Error::config(err.to_string()),
            EngineError::AlreadyRunning | EngineError::NotRunning => Error::internal(err.to_string()),
            EngineError::InterfaceSetup(_) | EngineError::UplinkSetup { .. } => {
                Error::setup_with_source("engine start failed", err)
            }
        }
    }
}

/// Why a single packet could not be forwarded. The packet is dropped.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Uplink {0} has no available network")]
    UplinkUnavailable(Uplink),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(TransportProtocol),

    /// Later IPv4 fragment; there is no reassembly to recover its ports
    #[error("Trailing {0} fragment")]
    Fragment(TransportProtocol),

    #[error("Socket protection failed: {0}")]
    ProtectFailed(#[source] NetStackError),

    #[error("Binding to uplink failed: {0}")]
    BindFailed(#[source] NetStackError),

    #[error("Malformed packet: {0}")]
    Classify(#[from] ClassifyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Virtual interface closed")]
    InterfaceClosed,
}

impl ForwardError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UplinkUnavailable(_) => "UPLINK_UNAVAILABLE",
            Self::UnsupportedProtocol(_) => "UNSUPPORTED_PROTOCOL",
            Self::Fragment(_) => "FRAGMENT",
            Self::ProtectFailed(_) => "PROTECT_FAILED",
            Self::BindFailed(_) => "BIND_FAILED",
            Self::Classify(_) => "CLASSIFY",
            Self::Io(_) => "IO",
            Self::InterfaceClosed => "INTERFACE_CLOSED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::config("bad").code(), "CONFIG");
        assert!(!Error::config("bad").is_recoverable());
        let err = Error::resource("I/O task panicked", "SplitLink");
        assert_eq!(err.code(), "RESOURCE");
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "Resource error: I/O task panicked (SplitLink)");

        assert_eq!(EngineError::MissingArgument("uplink_a.ssid").code(), "MISSING_ARGUMENT");
        assert_eq!(ForwardError::UplinkUnavailable(Uplink::B).code(), "UPLINK_UNAVAILABLE");
        assert_eq!(
            ForwardError::UplinkUnavailable(Uplink::A).to_string(),
            "Uplink A has no available network"
        );
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: Error = EngineError::InterfaceSetup(NetStackError::InterfaceSetup("denied".into())).into();
        assert_eq!(err.code(), "SETUP");
        let err: Error = EngineError::NotRunning.into();
        assert_eq!(err.code(), "INTERNAL");
    }
}
