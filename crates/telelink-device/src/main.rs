//! Telelink device entry point.
//!
//! Loads the TOML configuration, builds a Device over an in-memory register
//! source, attaches one connection per `[[connections]]` entry and runs
//! until Ctrl+C.
//!
//! ```text
//! main()
//!  └─ load_config()            -- validate identities before any socket
//!  └─ Device::new()            -- datasets, setup map, register source
//!  └─ ConnectionManager::new() -- one per server, answers via Device::handler()
//!  └─ Device::start()          -- polling + supervisory loops, connect links
//!  └─ ctrl_c → Device::stop()
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use telelink_device::application::Device;
use telelink_device::infrastructure::network::ConnectionManager;
use telelink_device::infrastructure::registers::MemoryRegisterSource;
use telelink_device::infrastructure::storage::config::load_config;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Telelink field device.
#[derive(Debug, Parser)]
#[command(
    name = "telelink-device",
    about = "Secure telemetry client: reports device data to one or more servers",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, default_value = "telelink.toml", env = "TELELINK_CONFIG")]
    config: PathBuf,

    /// Log level used when `RUST_LOG` is unset.  Overrides `log_level` from
    /// the configuration file.
    #[arg(long)]
    log_level: Option<String>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.device.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let settings = config.device.settings().context("invalid [device] section")?;
    let connections = config.connections().context("invalid [[connections]] entry")?;
    if connections.is_empty() {
        anyhow::bail!("no [[connections]] configured in {}", cli.config.display());
    }

    info!(
        node_id = settings.node_id,
        connections = connections.len(),
        datasets = config.datasets.len(),
        "Telelink device starting"
    );

    // ── Register source ───────────────────────────────────────────────────────
    // Seeded with the configured setup values so the first poll agrees with
    // the setup map.
    let registers = Arc::new(MemoryRegisterSource::with_values(
        config
            .setup
            .iter()
            .filter_map(|entry| entry.register.map(|r| (r, entry.value))),
    ));

    let device = Device::new(
        settings,
        config.datasets(),
        config.setup_map(),
        registers,
        Arc::new(|| 0u8),
    );

    for (identity, conn_settings) in connections {
        let manager = ConnectionManager::new(identity, conn_settings, device.handler());
        device.add_connection(manager);
    }

    device.start().await;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
    }

    device.stop().await;
    info!("Telelink device stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
