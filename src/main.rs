//! CLI entry point for rust_hkd
//!
//! Run the daemon:
//! ```bash
//! rust_hkd run hardware.json --settings hkd.toml
//! ```
//!
//! Change a target on a running daemon:
//! ```bash
//! rust_hkd send vset H_still 1.25
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_hkd::app::Daemon;
use rust_hkd::config::{HardwareConfig, Settings};
use rust_hkd::network::{send_command, CommandKind, TargetCommand};

const MIN_CPUS: usize = 4;
const MIN_MEMORY_BYTES: u64 = 15 * 1024 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "rust_hkd")]
#[command(about = "Cryostat housekeeping data acquisition daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the devices in a hardware file until Ctrl-C
    Run {
        /// Hardware description (JSON array, or TOML with a `devices` array)
        hardware: PathBuf,

        /// Daemon settings file
        #[arg(long)]
        settings: Option<PathBuf>,
    },

    /// Send one target command to a running daemon
    Send {
        /// vset, pset, iset, irset, sset, tset or perset
        command: String,

        /// Sensor name or alias
        name: String,

        /// New target value
        #[arg(allow_negative_numbers = true)]
        value: f64,

        /// Command listener address
        #[arg(long, default_value = "127.0.0.1:7945")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { hardware, settings } => run_daemon(&hardware, settings.as_deref()).await,
        Commands::Send {
            command,
            name,
            value,
            addr,
        } => {
            init_tracing("info", false);
            let kind: CommandKind = command.parse()?;
            let command = TargetCommand::new(kind, &name, value)?;
            send_command(addr, &command)
                .await
                .with_context(|| format!("Failed to send command to {}", addr))?;
            Ok(())
        }
    }
}

async fn run_daemon(hardware_path: &Path, settings_path: Option<&Path>) -> Result<()> {
    let settings = Settings::load(settings_path).context("Failed to load settings")?;
    init_tracing(&settings.application.log_level, settings.application.json_logs);
    info!(name = %settings.application.name, "Starting housekeeping daemon");
    check_host();

    let hardware = HardwareConfig::load(hardware_path).with_context(|| {
        format!("Failed to load hardware file {}", hardware_path.display())
    })?;
    let daemon = Daemon::start(settings, hardware)
        .await
        .context("Failed to start daemon")?;
    info!(addr = %daemon.command_addr()?, "Daemon running, press Ctrl-C to stop");

    daemon
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for Ctrl-C, stopping");
            }
        })
        .await
        .context("Daemon stopped with errors")?;
    info!("Daemon stopped");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides `level`.
fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Warn when the host looks too small for continuous acquisition.
fn check_host() {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    if cpus < MIN_CPUS {
        warn!(cpus, minimum = MIN_CPUS, "Few CPUs available for acquisition");
    }

    let system = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
    );
    let memory = system.total_memory();
    if memory < MIN_MEMORY_BYTES {
        warn!(
            memory_gb = memory / 1024 / 1024 / 1024,
            minimum_gb = MIN_MEMORY_BYTES / 1024 / 1024 / 1024,
            "Host has little memory for acquisition"
        );
    }
}
