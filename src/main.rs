//! CLI entry point for wlm-monitor.
//!
//! Provides a command-line interface for:
//! - Running the monitor against simulated control servers (`run --sim`)
//! - Checking a configuration file (`check-config`)
//!
//! The crate ships no network transport (the control-server wire protocol
//! lives behind the `ServerConnector` trait), so `run` currently requires
//! `--sim`, which builds one simulated server per `[servers]` entry and
//! registers every configured laser on each of them.
//!
//! # Usage
//!
//! ```bash
//! wlm-monitor run --sim
//! wlm-monitor check-config --config config/default.toml
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use wlm_monitor::config::Settings;
use wlm_monitor::logging;
use wlm_monitor::mock::{MockConnector, MockWlmServer};
use wlm_monitor::monitor::{DeviceHandle, Monitor};
use wlm_monitor::readout;

#[derive(Parser)]
#[command(name = "wlm-monitor")]
#[command(about = "Live diagnostics for wavemeter-tracked lasers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor until Ctrl-C
    Run {
        /// Path to the configuration file
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,

        /// Use simulated control servers
        #[arg(long)]
        sim: bool,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Path to the configuration file
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, sim } => run_monitor(config, sim).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

async fn run_monitor(config_path: PathBuf, sim: bool) -> Result<()> {
    if !sim {
        bail!("No network transport is built in yet; run with --sim to use simulated servers");
    }

    let settings = Settings::load_from(&config_path)?;
    settings.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    println!("🔬 wlm-monitor - live laser diagnostics");
    println!(
        "   {} device(s), {} simulated server(s)",
        settings.devices.len(),
        settings.servers.len()
    );
    println!();

    // One simulated server per [servers] entry; every laser is registered on
    // all of them so devices can be moved between servers at runtime.
    let mut connector = MockConnector::new();
    let mut servers = Vec::new();
    for (name, address) in &settings.servers {
        let server = MockWlmServer::new();
        for definition in settings.devices.values() {
            server.add_device(&definition.laser, base_frequency_for(&definition.laser));
        }
        connector.add_server(address.host.clone(), address.port, server.clone());
        info!(server = %name, host = %address.host, port = address.port, "Simulated server ready");
        servers.push(server);
    }

    let mut monitor = Monitor::new(&settings, Arc::new(connector))?;
    let sink = monitor.sink();
    for server in &servers {
        server.attach_sink(Arc::clone(&sink));
    }
    monitor.spawn();

    let readout_task = tokio::spawn(log_readouts(monitor.devices()));

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");
    readout_task.abort();
    monitor.shutdown().await;

    println!("👋 Monitor stopped");
    Ok(())
}

/// Periodically log one readout line per device, the way a display surface
/// would render them.
async fn log_readouts(handles: Vec<DeviceHandle>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        ticker.tick().await;
        for handle in &handles {
            let settings = handle.settings();
            let reference = settings
                .as_ref()
                .map(|s| s.reference_frequency_hz)
                .unwrap_or_default();
            let line = readout::frequency_readout(handle.frequency().as_ref(), reference);
            let lock = readout::lock_text(settings.as_ref());

            match readout::connection_notice(handle.connection_state()) {
                Some(notice) => info!(
                    device = %handle.display_name(),
                    status = notice,
                    "Readout"
                ),
                None => info!(
                    device = %handle.display_name(),
                    frequency = %line.frequency,
                    detuning = %line.detuning,
                    lock = %lock,
                    "Readout"
                ),
            }
        }
    }
}

fn check_config(config_path: PathBuf) -> Result<()> {
    let settings = Settings::load_from(&config_path)?;
    match settings.validate() {
        Ok(()) => {
            println!("✅ {} is valid", config_path.display());
            println!("   servers: {}", settings.servers.len());
            for (name, device) in &settings.devices {
                println!(
                    "   device '{}' -> laser '{}', server {}",
                    name,
                    device.laser,
                    device.initial_server().unwrap_or("(unassigned)")
                );
            }
            // Effective configuration, with defaults filled in and
            // environment overrides applied.
            println!();
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
        Err(reason) => {
            eprintln!("❌ {} is invalid: {}", config_path.display(), reason);
            bail!("Configuration invalid");
        }
    }
}

/// Deterministic per-laser base frequency for the simulated servers,
/// spread over the optical band.
fn base_frequency_for(laser: &str) -> f64 {
    let seed = laser
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    3.0e14 + f64::from(seed % 500_000) * 1.0e9
}
