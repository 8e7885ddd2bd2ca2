//! Linux virtual interface: a tun-rs device plus `ip` policy routing.
//!
//! Captured traffic is steered into a dedicated routing table. Excluded
//! applications (by uid) and protected sockets (by fwmark) are sent back to
//! the main table ahead of the capture rule.

use crate::error::{NetStackError, Result};
use crate::tun::{PacketDevice, TunBuilder, TunConfig, TunProvider};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_ROUTE_TABLE: u32 = 7700;
pub const DEFAULT_RULE_PRIORITY: u32 = 7700;

pub type UidLookup = Arc<dyn Fn(&str) -> Option<u32> + Send + Sync>;

pub struct LinuxTunProvider {
    fwmark: u32,
    table: u32,
    priority: u32,
    uid_lookup: UidLookup,
}

impl LinuxTunProvider {
    /// `fwmark` must match the mark set by the socket protector.
    pub fn new<F>(fwmark: u32, uid_lookup: F) -> Self
    where
        F: Fn(&str) -> Option<u32> + Send + Sync + 'static,
    {
        Self {
            fwmark,
            table: DEFAULT_ROUTE_TABLE,
            priority: DEFAULT_RULE_PRIORITY,
            uid_lookup: Arc::new(uid_lookup),
        }
    }

    pub fn with_table(mut self, table: u32, priority: u32) -> Self {
        self.table = table;
        self.priority = priority;
        self
    }
}

/// Numeric uids are taken as-is, anything else goes through the lookup
fn resolve_uid(lookup: &UidLookup, app: &str) -> Option<u32> {
    app.parse().ok().or_else(|| lookup(app))
}

impl TunProvider for LinuxTunProvider {
    fn builder(&self, config: &TunConfig) -> Result<Box<dyn TunBuilder>> {
        if config.session_name.is_empty() || config.session_name.len() > 15 {
            return Err(NetStackError::InterfaceSetup(format!(
                "invalid interface name: {:?}",
                config.session_name
            )));
        }
        Ok(Box::new(LinuxTunBuilder {
            config: config.clone(),
            fwmark: self.fwmark,
            table: self.table,
            priority: self.priority,
            excluded_uids: Vec::new(),
            uid_lookup: self.uid_lookup.clone(),
        }))
    }
}

struct LinuxTunBuilder {
    config: TunConfig,
    fwmark: u32,
    table: u32,
    priority: u32,
    excluded_uids: Vec<u32>,
    uid_lookup: UidLookup,
}

impl TunBuilder for LinuxTunBuilder {
    fn add_disallowed_application(&mut self, app: &str) -> Result<()> {
        let uid = resolve_uid(&self.uid_lookup, app)
            .ok_or_else(|| NetStackError::UnknownApplication(app.to_string()))?;
        if !self.excluded_uids.contains(&uid) {
            self.excluded_uids.push(uid);
        }
        Ok(())
    }

    fn establish(self: Box<Self>) -> Result<Box<dyn PacketDevice>> {
        use tun_rs::DeviceBuilder;

        let config = &self.config;
        let builder = DeviceBuilder::new().name(&config.session_name).mtu(config.mtu);
        let builder = match config.address {
            IpAddr::V4(addr) => builder.ipv4(addr, config.prefix_len, None::<Ipv4Addr>),
            IpAddr::V6(addr) => builder.ipv6(addr, config.prefix_len),
        };
        let device = builder
            .build_async()
            .map_err(|e| NetStackError::TunError(format!("Failed to create TUN: {}", e)))?;
        info!(
            "TUN device created: {} with address {}/{}",
            config.session_name, config.address, config.prefix_len
        );

        let mut routing = PolicyRouting::default();
        for cmd in setup_commands(config, self.fwmark, self.table, self.priority, &self.excluded_uids) {
            if let Err(e) = routing.apply(cmd) {
                // Undo whatever went in before reporting
                drop(routing);
                return Err(e);
            }
        }
        set_link_dns(&config.session_name, config.dns);

        Ok(Box::new(LinuxTunDevice { device, _routing: routing }))
    }
}

/// One reversible `ip` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
struct IpCommand {
    add: Vec<String>,
    del: Vec<String>,
}

impl IpCommand {
    fn new(family: &str, object: &str, selector: Vec<String>) -> Self {
        let build = |verb: &str| {
            let mut args = vec![family.to_string(), object.to_string(), verb.to_string()];
            args.extend(selector.iter().cloned());
            args
        };
        Self {
            add: build("add"),
            del: build("del"),
        }
    }
}

fn family_flag(addr: &IpAddr) -> &'static str {
    if addr.is_ipv4() {
        "-4"
    } else {
        "-6"
    }
}

fn setup_commands(config: &TunConfig, fwmark: u32, table: u32, priority: u32, uids: &[u32]) -> Vec<IpCommand> {
    let family = family_flag(&config.route.addr);
    let table = table.to_string();
    let mut cmds = vec![IpCommand::new(
        family,
        "route",
        vec![
            config.route.to_string(),
            "dev".to_string(),
            config.session_name.clone(),
            "table".to_string(),
            table.clone(),
        ],
    )];

    let mut prio = priority;
    for uid in uids {
        cmds.push(IpCommand::new(
            family,
            "rule",
            vec![
                "uidrange".to_string(),
                format!("{}-{}", uid, uid),
                "lookup".to_string(),
                "main".to_string(),
                "priority".to_string(),
                prio.to_string(),
            ],
        ));
        prio += 1;
    }

    cmds.push(IpCommand::new(
        family,
        "rule",
        vec![
            "fwmark".to_string(),
            format!("{:#x}", fwmark),
            "lookup".to_string(),
            "main".to_string(),
            "priority".to_string(),
            prio.to_string(),
        ],
    ));
    cmds.push(IpCommand::new(
        family,
        "rule",
        vec![
            "lookup".to_string(),
            table,
            "priority".to_string(),
            (prio + 1).to_string(),
        ],
    ));
    cmds
}

fn run_ip(args: &[String]) -> Result<()> {
    debug!("Running: ip {}", args.join(" "));
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| NetStackError::RoutingError(format!("Failed to run ip: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NetStackError::RoutingError(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

fn set_link_dns(interface: &str, dns: IpAddr) {
    // Best effort: only hosts running systemd-resolved honour per-link DNS
    match Command::new("resolvectl").args(["dns", interface, &dns.to_string()]).output() {
        Ok(out) if out.status.success() => debug!("DNS {} set on {}", dns, interface),
        _ => debug!("Per-link DNS not configured for {}", interface),
    }
}

/// Installed rules, removed in reverse order on drop
#[derive(Default)]
struct PolicyRouting {
    applied: Vec<IpCommand>,
}

impl PolicyRouting {
    fn apply(&mut self, cmd: IpCommand) -> Result<()> {
        run_ip(&cmd.add)?;
        self.applied.push(cmd);
        Ok(())
    }
}

impl Drop for PolicyRouting {
    fn drop(&mut self) {
        while let Some(cmd) = self.applied.pop() {
            if let Err(e) = run_ip(&cmd.del) {
                warn!("Failed to remove routing entry: {}", e);
            }
        }
    }
}

struct LinuxTunDevice {
    device: tun_rs::AsyncDevice,
    _routing: PolicyRouting,
}

#[async_trait]
impl PacketDevice for LinuxTunDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.recv(buf).await
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.device.send(packet).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_commands_order() {
        let config = TunConfig::default();
        let cmds = setup_commands(&config, 0x1ee7, 7700, 100, &[10123, 10456]);
        assert_eq!(cmds.len(), 5);

        assert_eq!(
            cmds[0].add,
            ["-4", "route", "add", "0.0.0.0/0", "dev", "SplitLink", "table", "7700"]
        );
        assert_eq!(
            cmds[1].add,
            ["-4", "rule", "add", "uidrange", "10123-10123", "lookup", "main", "priority", "100"]
        );
        assert_eq!(cmds[2].add[4], "10456-10456");
        assert_eq!(
            cmds[3].add,
            ["-4", "rule", "add", "fwmark", "0x1ee7", "lookup", "main", "priority", "102"]
        );
        assert_eq!(cmds[4].del, ["-4", "rule", "del", "lookup", "7700", "priority", "103"]);
    }

    #[test]
    fn test_uid_resolution() {
        let provider = LinuxTunProvider::new(1, |app| (app == "com.example").then_some(10077));
        assert_eq!(resolve_uid(&provider.uid_lookup, "1000"), Some(1000));
        assert_eq!(resolve_uid(&provider.uid_lookup, "com.example"), Some(10077));
        assert_eq!(resolve_uid(&provider.uid_lookup, "com.missing"), None);

        let mut builder = provider.builder(&TunConfig::default()).unwrap();
        assert!(builder.add_disallowed_application("com.example").is_ok());
        assert!(matches!(
            builder.add_disallowed_application("com.missing"),
            Err(NetStackError::UnknownApplication(_))
        ));
    }

    #[test]
    fn test_interface_name_checked() {
        let provider = LinuxTunProvider::new(1, |_| None);
        let config = TunConfig {
            session_name: "a-name-longer-than-ifnamsiz".to_string(),
            ..TunConfig::default()
        };
        assert!(provider.builder(&config).is_err());
    }
}
