//! SplitLink engine
//!
//! Captures traffic through a virtual interface, attributes every new flow to
//! the application that opened it, and forwards it over one of two uplinks:
//! listed applications use Uplink A, everything else Uplink B. A flow keeps
//! the uplink it was first assigned for its whole life.

pub mod classifier;
pub mod config;
pub mod connection_tracker;
pub mod engine;
pub mod error;
pub mod forwarder;
pub mod logging;
pub mod policy;
pub mod stats;
pub mod uplink;


pub use classifier::{OwnerResolver, ProcOwnerResolver};
pub use config::*;
pub use connection_tracker::{ConnectionTracker, FlowRecord, FlowSnapshot};
pub use engine::{Engine, EngineState};
pub use error::*;
pub use policy::{ApplicationId, ApplicationSet, PolicyStore, RoutingPolicy, Uplink};
pub use stats::{EngineStats, StatsSnapshot};
pub use uplink::{UplinkManager, UplinkState, Uplinks};

/// User-Agent style identifier, e.g. "SplitLink/v0.1.0"
pub const USER_AGENT: &str = concat!("SplitLink/v", env!("CARGO_PKG_VERSION"));
