pub mod validator;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use splitlink_netstack::{RoutePrefix, TunConfig};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub flows: FlowConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        validator::ConfigValidator::validate(self)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::config_with_source("Failed to parse engine config", e))?;
        config.validate()?;
        Ok(config)
    }
}

/// Virtual interface settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterfaceConfig {
    #[serde(default = "default_session_name")]
    pub session_name: String,
    #[serde(default = "default_address")]
    pub address: IpAddr,
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
    #[serde(default = "default_route")]
    pub route: String,
    #[serde(default = "default_dns")]
    pub dns: IpAddr,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Keep Uplink A applications out of the interface entirely
    #[serde(default = "default_true")]
    pub exclude_uplink_a_apps: bool,
    /// Applications never captured, on top of the Uplink A set
    #[serde(default)]
    pub always_excluded: Vec<String>,
    /// Re-create the interface when the application set changes so that
    /// exclusions follow it. Interrupts every captured flow.
    #[serde(default)]
    pub rebuild_on_app_change: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            session_name: default_session_name(),
            address: default_address(),
            prefix_len: default_prefix_len(),
            route: default_route(),
            dns: default_dns(),
            mtu: default_mtu(),
            exclude_uplink_a_apps: true,
            always_excluded: Vec::new(),
            rebuild_on_app_change: false,
        }
    }
}

impl InterfaceConfig {
    pub fn route_prefix(&self) -> Result<RoutePrefix> {
        self.route
            .parse()
            .map_err(|e| Error::config_with_source(format!("Invalid route: {}", self.route), e))
    }

    pub fn tun_config(&self) -> Result<TunConfig> {
        Ok(TunConfig {
            session_name: self.session_name.clone(),
            address: self.address,
            prefix_len: self.prefix_len,
            route: self.route_prefix()?,
            dns: self.dns,
            mtu: self.mtu,
        })
    }

    /// Applications to exclude given the current Uplink A set
    pub fn excluded_applications<'a, I>(&self, uplink_a_apps: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut excluded: Vec<String> = self.always_excluded.clone();
        if self.exclude_uplink_a_apps {
            for app in uplink_a_apps {
                if !excluded.iter().any(|e| e == app) {
                    excluded.push(app.to_string());
                }
            }
        }
        excluded
    }
}

/// Flow table settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowConfig {
    /// Evict flows idle for longer than this; 0 disables eviction
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl FlowConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Relay settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwarderConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Receive window advertised to captured TCP clients
    #[serde(default = "default_tcp_window")]
    pub tcp_window: u16,
    #[serde(default = "default_buffer_size")]
    pub relay_buffer_size: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            tcp_window: default_tcp_window(),
            relay_buffer_size: default_buffer_size(),
        }
    }
}

impl ForwarderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Debug,
    Silent,
}

fn default_session_name() -> String {
    "SplitLink".to_string()
}

fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))
}

fn default_prefix_len() -> u8 {
    32
}

fn default_route() -> String {
    "0.0.0.0/0".to_string()
}

fn default_dns() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))
}

fn default_mtu() -> u16 {
    1500
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_cleanup_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_tcp_window() -> u16 {
    65535
}

fn default_buffer_size() -> usize {
    64 * 1024
}
