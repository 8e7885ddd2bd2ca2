#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
mod config;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

/// SplitLink - per-application split tunnelling over two uplinks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(short, long)]
    test_config: bool,

    /// Write the buffered log to this file on exit
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[cfg(target_os = "linux")]
mod host {
    use crate::config::HostConfig;
    use crate::Args;
    use anyhow::{Context, Result};
    use futures::StreamExt;
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;
    use splitlink_core::{logging, Engine, ProcOwnerResolver, USER_AGENT};
    use splitlink_netstack::{LinuxSocketProtector, LinuxTunProvider, SysfsMonitor};
    use splitlink_sock2proc::PackageRegistry;
    use std::sync::Arc;
    use tracing::{error, info, warn};

    fn load_packages(config: &HostConfig) -> PackageRegistry {
        let loaded = match &config.packages_list {
            Some(path) => PackageRegistry::load(path),
            None => PackageRegistry::load_default(),
        };
        loaded.unwrap_or_else(|e| {
            info!("No package list ({}), matching applications by process name", e);
            PackageRegistry::new()
        })
    }

    /// Push apps and identities from a re-read config into the running engine
    async fn reload(engine: &Engine, resolver: &ProcOwnerResolver, args: &Args) -> Result<()> {
        let config = HostConfig::load(&args.config)?;
        if config.engine != *engine.config() {
            warn!("Interface, flow and forwarder settings only change on restart");
        }
        resolver.reload_packages(load_packages(&config));
        engine.update_applications(&config.apps).await?;
        engine.update_uplink_a_identity(&config.uplink_a).await?;
        engine.update_uplink_b_identity(&config.uplink_b).await?;
        Ok(())
    }

    pub async fn run(args: Args) -> Result<()> {
        let config = HostConfig::load(&args.config)?;
        if args.test_config {
            println!("Configuration test passed!");
            return Ok(());
        }
        logging::init_logging(config.engine.log_level)?;
        info!("{} starting", USER_AGENT);

        let resolver = Arc::new(ProcOwnerResolver::new(load_packages(&config)));
        let lookup = resolver.clone();
        let provider = LinuxTunProvider::new(config.protect_mark, move |app| lookup.uid_for_package(app));
        let monitor = SysfsMonitor::new(config.monitor_interval());
        let protector = LinuxSocketProtector::new(config.protect_mark);

        let engine = Engine::new(
            config.engine.clone(),
            Arc::new(provider),
            Arc::new(monitor),
            Arc::new(protector),
            resolver.clone(),
        )?;
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP]).context("Failed to register signal handlers")?;

        engine.start(&config.apps, &config.uplink_a, &config.uplink_b).await?;
        println!("SplitLink started. Press Ctrl+C to stop.");

        while let Some(signal) = signals.next().await {
            match signal {
                SIGHUP => {
                    info!("Reloading {}", args.config.display());
                    if let Err(e) = reload(&engine, &resolver, &args).await {
                        error!("Reload failed: {:#}", e);
                    }
                    if !engine.is_running() {
                        break;
                    }
                }
                _ => break,
            }
        }

        println!("Shutting down SplitLink...");
        let stats = engine.stats();
        engine.stop().await;
        info!(
            "Forwarded {} packets ({} bytes over A, {} over B), dropped {}, {} flows total",
            stats.packets_forwarded,
            stats.uplink_a_bytes,
            stats.uplink_b_bytes,
            stats.dropped(),
            stats.total_flows
        );

        if let Some(path) = &args.log_file {
            let lines = logging::get_recent_logs(0);
            std::fs::write(path, lines.join("\n"))
                .with_context(|| format!("Failed to write log file {}", path.display()))?;
        }
        println!("SplitLink stopped.");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<()> {
    host::run(Args::parse()).await
}

#[cfg(not(target_os = "linux"))]
fn main() -> Result<()> {
    let _ = Args::parse();
    anyhow::bail!("the SplitLink CLI host supports Linux only; embed splitlink-core on other platforms")
}
