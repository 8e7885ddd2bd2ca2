use anyhow::{bail, Context, Result};
use serde::Deserialize;
use splitlink_core::EngineConfig;
use splitlink_netstack::NetworkIdentity;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PROTECT_MARK: u32 = 0x5e11;

/// Engine settings plus what the host passes to start
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    /// Applications routed over Uplink A: package names, process names or uids
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default)]
    pub uplink_a: HashMap<String, String>,
    #[serde(default)]
    pub uplink_b: HashMap<String, String>,
    /// fwmark carried by forwarding sockets and skipped by the capture rule
    #[serde(default = "default_protect_mark")]
    pub protect_mark: u32,
    /// uid to package map, Android `packages.list` format
    #[serde(default)]
    pub packages_list: Option<PathBuf>,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
}

impl HostConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if NetworkIdentity::from_map(&self.uplink_a).is_none() {
            bail!("uplink_a.ssid is required");
        }
        if NetworkIdentity::from_map(&self.uplink_b).is_none() {
            bail!("uplink_b.ssid is required");
        }
        if self.protect_mark == 0 {
            bail!("protect_mark must be non-zero");
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(100))
    }
}

fn default_protect_mark() -> u32 {
    DEFAULT_PROTECT_MARK
}

fn default_monitor_interval() -> u64 {
    1000
}
