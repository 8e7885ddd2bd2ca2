//! Per-application routing policy.
//!
//! The policy is an immutable snapshot behind an [`ArcSwap`]: the capture
//! loop loads it lock-free for every new flow and control operations swap in
//! a whole new snapshot, so a reader sees either the old or the new policy.

use arc_swap::{ArcSwap, Guard};
use serde::{Deserialize, Serialize};
use splitlink_netstack::NetworkIdentity;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// One of the two upstream network slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Uplink {
    A,
    B,
}

impl Uplink {
    pub const ALL: [Uplink; 2] = [Uplink::A, Uplink::B];
}

impl fmt::Display for Uplink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uplink::A => write!(f, "A"),
            Uplink::B => write!(f, "B"),
        }
    }
}

/// Application that owns a flow
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ApplicationId {
    /// Package name, or process name where there are no packages
    Package(Arc<str>),
    Unknown,
}

impl ApplicationId {
    pub fn package(name: impl AsRef<str>) -> Self {
        Self::Package(Arc::from(name.as_ref()))
    }

    pub fn as_package(&self) -> Option<&str> {
        match self {
            Self::Package(name) => Some(&**name),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Package(name) => write!(f, "{}", name),
            Self::Unknown => write!(f, "<unknown>"),
        }
    }
}

/// Set of applications routed over Uplink A
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationSet {
    apps: HashSet<Arc<str>>,
}

impl ApplicationSet {
    pub fn new<I, S>(apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            apps: apps
                .into_iter()
                .map(|a| a.as_ref().trim().to_string())
                .filter(|a| !a.is_empty())
                .map(Arc::from)
                .collect(),
        }
    }

    pub fn contains(&self, app: &ApplicationId) -> bool {
        match app {
            ApplicationId::Package(name) => self.apps.contains(name),
            ApplicationId::Unknown => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.apps.iter().map(|a| &**a)
    }

    /// Sorted copy, for stable logging and interface exclusion lists
    pub fn sorted(&self) -> Vec<String> {
        let mut apps: Vec<String> = self.iter().map(str::to_string).collect();
        apps.sort();
        apps
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

/// Which applications use which uplink, and which networks the uplinks are
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingPolicy {
    pub uplink_a_apps: ApplicationSet,
    pub uplink_a: NetworkIdentity,
    pub uplink_b: NetworkIdentity,
}

impl RoutingPolicy {
    pub fn new(uplink_a_apps: ApplicationSet, uplink_a: NetworkIdentity, uplink_b: NetworkIdentity) -> Self {
        Self {
            uplink_a_apps,
            uplink_a,
            uplink_b,
        }
    }

    /// Listed applications go to A; everything else, including unknown
    /// owners, goes to B.
    pub fn uplink_for(&self, app: &ApplicationId) -> Uplink {
        if self.uplink_a_apps.contains(app) {
            Uplink::A
        } else {
            Uplink::B
        }
    }

    pub fn identity(&self, uplink: Uplink) -> &NetworkIdentity {
        match uplink {
            Uplink::A => &self.uplink_a,
            Uplink::B => &self.uplink_b,
        }
    }
}

/// Atomically swappable policy shared by the engine and the capture loop
pub struct PolicyStore {
    current: ArcSwap<RoutingPolicy>,
}

impl PolicyStore {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self {
            current: ArcSwap::from_pointee(policy),
        }
    }

    /// Lock-free snapshot
    pub fn load(&self) -> Guard<Arc<RoutingPolicy>> {
        self.current.load()
    }

    /// Owned snapshot, for holding across await points
    pub fn snapshot(&self) -> Arc<RoutingPolicy> {
        self.current.load_full()
    }

    pub fn store(&self, policy: RoutingPolicy) {
        self.current.store(Arc::new(policy));
    }

    /// Swap in a modified copy of the current policy
    pub fn update<F>(&self, f: F) -> Arc<RoutingPolicy>
    where
        F: Fn(&RoutingPolicy) -> RoutingPolicy,
    {
        self.current.rcu(|old| f(&**old));
        self.current.load_full()
    }
}
