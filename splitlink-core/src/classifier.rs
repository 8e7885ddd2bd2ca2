//! Attributes captured packets to the application that sent them.

use crate::policy::ApplicationId;
use parking_lot::RwLock;
use splitlink_netstack::{ParsedPacket, TransportProtocol};
use splitlink_sock2proc::{PackageRegistry, Protocol, Sock2ProcError};
use tracing::{debug, trace, warn};

pub use splitlink_netstack::classify;

/// Maps a packet to its owning application. Never fails: anything that
/// cannot be attributed is [`ApplicationId::Unknown`].
pub trait OwnerResolver: Send + Sync {
    fn resolve(&self, packet: &ParsedPacket) -> ApplicationId;
}

impl<F> OwnerResolver for F
where
    F: Fn(&ParsedPacket) -> ApplicationId + Send + Sync,
{
    fn resolve(&self, packet: &ParsedPacket) -> ApplicationId {
        self(packet)
    }
}

/// Looks the flow up in `/proc/net/{tcp,udp}{,6}` and maps the owning uid
/// through the package registry. Where the registry has no entry (desktop
/// Linux) the owning process name is used instead.
pub struct ProcOwnerResolver {
    packages: RwLock<PackageRegistry>,
    process_fallback: bool,
}

impl ProcOwnerResolver {
    pub fn new(packages: PackageRegistry) -> Self {
        Self {
            packages: RwLock::new(packages),
            process_fallback: true,
        }
    }

    /// Load the system package list, starting empty when it is unreadable
    pub fn from_system() -> Self {
        let packages = match PackageRegistry::load_default() {
            Ok(registry) => {
                debug!("Loaded {} packages", registry.len());
                registry
            }
            Err(e) => {
                debug!("No package registry ({}), using process names", e);
                PackageRegistry::new()
            }
        };
        Self::new(packages)
    }

    pub fn with_process_fallback(mut self, enabled: bool) -> Self {
        self.process_fallback = enabled;
        self
    }

    pub fn reload_packages(&self, packages: PackageRegistry) {
        *self.packages.write() = packages;
    }

    pub fn uid_for_package(&self, package: &str) -> Option<u32> {
        self.packages.read().uid_for_package(package)
    }

    fn lookup(&self, packet: &ParsedPacket) -> Result<ApplicationId, Sock2ProcError> {
        let protocol = match packet.protocol {
            TransportProtocol::Tcp => Protocol::Tcp,
            TransportProtocol::Udp => Protocol::Udp,
            _ => return Ok(ApplicationId::Unknown),
        };
        let (Some(local), Some(remote)) = (packet.src_socket(), packet.dst_socket()) else {
            return Ok(ApplicationId::Unknown);
        };

        let owner = splitlink_sock2proc::find_socket_owner(protocol, local, remote)?;
        if let Some(package) = self.packages.read().package_for_uid(owner.uid) {
            return Ok(ApplicationId::package(package));
        }
        if self.process_fallback {
            let process = splitlink_sock2proc::find_process_by_inode(owner.inode)?;
            return Ok(ApplicationId::package(process.name));
        }
        Ok(ApplicationId::Unknown)
    }
}

impl OwnerResolver for ProcOwnerResolver {
    fn resolve(&self, packet: &ParsedPacket) -> ApplicationId {
        match self.lookup(packet) {
            Ok(app) => {
                trace!("{} owned by {}", packet.flow_key(), app);
                app
            }
            Err(Sock2ProcError::PermissionDenied) => {
                warn!("Permission denied reading connection owners");
                ApplicationId::Unknown
            }
            Err(e) => {
                debug!("Owner of {} not resolved: {}", packet.flow_key(), e);
                ApplicationId::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icmp_packet() -> Vec<u8> {
        let mut raw = vec![0u8; 28];
        raw[0] = 0x45;
        raw[3] = 28;
        raw[9] = 1;
        raw[12..16].copy_from_slice(&[10, 0, 0, 2]);
        raw[16..20].copy_from_slice(&[1, 1, 1, 1]);
        raw
    }

    #[test]
    fn test_non_port_protocols_are_unknown() {
        let parsed = classify(&icmp_packet()).unwrap();
        let resolver = ProcOwnerResolver::new(PackageRegistry::new());
        assert_eq!(resolver.resolve(&parsed), ApplicationId::Unknown);
    }

    #[test]
    fn test_unmatched_flow_is_unknown() {
        let mut raw = vec![0u8; 28];
        raw[0] = 0x45;
        raw[3] = 28;
        raw[9] = 17;
        raw[12..16].copy_from_slice(&[10, 0, 0, 2]);
        raw[16..20].copy_from_slice(&[192, 0, 2, 1]);
        raw[20..22].copy_from_slice(&1u16.to_be_bytes());
        raw[22..24].copy_from_slice(&9u16.to_be_bytes());
        let parsed = classify(&raw).unwrap();

        // No socket on this host is bound to 10.0.0.2:1
        let resolver = ProcOwnerResolver::new(PackageRegistry::new()).with_process_fallback(false);
        assert_eq!(resolver.resolve(&parsed), ApplicationId::Unknown);
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |p: &ParsedPacket| {
            if p.protocol == TransportProtocol::Icmp {
                ApplicationId::package("ping")
            } else {
                ApplicationId::Unknown
            }
        };
        let parsed = classify(&icmp_packet()).unwrap();
        assert_eq!(OwnerResolver::resolve(&resolver, &parsed), ApplicationId::package("ping"));
    }

    #[test]
    fn test_reload_packages() {
        let resolver = ProcOwnerResolver::new(PackageRegistry::new());
        assert_eq!(resolver.uid_for_package("com.example"), None);
        let list = "com.example 10061 0 /data/user/0/com.example default 3003\n";
        resolver.reload_packages(PackageRegistry::parse(list));
        assert_eq!(resolver.uid_for_package("com.example"), Some(10061));
    }
}
