mod bus;
mod config;
mod control;
mod events;
mod firecracker;
mod machine;
mod network;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::bus::Bus;
use crate::config::NodeConfig;
use crate::control::ApiListener;
use crate::firecracker::FirecrackerDriver;
use crate::machine::MachineManager;
use crate::telemetry::Telemetry;

#[derive(Parser)]
#[command(name = "nex-node", about = "Run workloads in Firecracker microVMs on this node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node and await control commands.
    Up {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Verify prerequisites without starting the node. Exits 0 if all pass.
    Preflight {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::load(&path),
        None => {
            let config = NodeConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Preflight { config } => {
            let config = load_config(config)?;
            run_preflight(&config)?;
        }
        Commands::Up { config } => {
            let config = load_config(config)?;
            run_node(config).await?;
        }
    }

    Ok(())
}

fn run_preflight(config: &NodeConfig) -> Result<()> {
    let mut failures = Vec::new();

    for (label, path) in [
        ("kernel image", &config.machine.kernel_path),
        ("root filesystem", &config.machine.rootfs_path),
    ] {
        if path.exists() {
            println!("ok: {} at {}", label, path.display());
        } else {
            failures.push(format!("{} missing: {}", label, path.display()));
        }
    }

    // The firecracker binary may be a bare name resolved via PATH.
    let binary = &config.machine.firecracker_binary;
    let resolved = if binary.components().count() > 1 {
        binary.exists()
    } else {
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).exists()))
            .unwrap_or(false)
    };
    if resolved {
        println!("ok: firecracker binary {}", binary.display());
    } else {
        failures.push(format!("firecracker binary not found: {}", binary.display()));
    }

    if failures.is_empty() {
        println!("preflight passed");
        Ok(())
    } else {
        for failure in &failures {
            eprintln!("failed: {failure}");
        }
        anyhow::bail!("preflight failed with {} problem(s)", failures.len());
    }
}

async fn run_node(config: NodeConfig) -> Result<()> {
    let node_id = uuid::Uuid::new_v4().simple().to_string();
    let cancel = CancellationToken::new();

    let external = Bus::new();
    let internal = Bus::new();
    let telemetry = Telemetry::new();
    let hypervisor = Arc::new(FirecrackerDriver::new(config.machine.clone()));

    let manager = MachineManager::new(
        config.clone(),
        external.clone(),
        internal,
        hypervisor,
        telemetry.clone(),
        cancel.clone(),
    )
    .await
    .context("failed to create machine manager")?;
    manager.start();

    let listener = ApiListener::new(manager.clone(), config.clone(), node_id.clone(), external);
    listener
        .start()
        .await
        .context("failed to start control API listener")?;

    if let Some(addr) = config.telemetry.bind {
        telemetry::start_exporter(addr, telemetry, manager.registry());
    }

    tracing::info!(node_id = %node_id, "node up");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, initiating shutdown");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
        _ = cancel.cancelled() => {
            tracing::warn!("node cancelled itself, initiating shutdown");
        }
    }

    listener.drain().await;
    manager.stop().await;
    tracing::info!("node shut down");

    Ok(())
}
