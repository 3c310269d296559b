//! fleetd — the fleetgrid operator binary.
//!
//! Converges deployment manifests and inspects persisted state:
//! - `deploy` runs the convergence engine and prints the task report
//! - `list` prints every deployment record
//! - `show` prints a deployment and its instances
//! - `locks` lists live locks
//! - `orphans` lists (or forgets) orphaned persistent disks
//!
//! Deployments run against the in-process simulated cloud and agents.
//!
//! # Usage
//!
//! ```text
//! fleetd --config fleetd.toml deploy manifests/cf.toml
//! fleetd show cf
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleet_core::config::LogFormat;
use fleet_core::{DeploymentManifest, FleetConfig};
use fleetgrid_agent::SimulatedAgents;
use fleetgrid_cloud::SimulatedCloud;
use fleetgrid_converge::Engine;
use fleetgrid_lock::LockManager;
use fleetgrid_state::StateStore;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,fleetd=debug,fleetgrid=debug";

#[derive(Parser)]
#[command(
    name = "fleetd",
    about = "fleetgrid — deployment convergence engine",
    version,
    propagate_version = true
)]
struct Cli {
    /// Daemon configuration file. Defaults apply when it does not exist.
    #[arg(short, long, default_value = "fleetd.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Converge a deployment toward a manifest (.toml or .json).
    Deploy {
        manifest: PathBuf,
        /// Latency added to every simulated cloud and agent call.
        #[arg(long, default_value = "0")]
        latency_ms: u64,
    },
    /// List deployments.
    List,
    /// Show a deployment and its instances.
    Show { deployment: String },
    /// List live locks.
    Locks,
    /// List orphaned persistent disks.
    Orphans {
        /// Drop the record of an orphaned disk reclaimed out of band.
        #[arg(long)]
        forget: Option<String>,
    },
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_tracing(config.log.format)?;

    match cli.command {
        Command::Deploy {
            manifest,
            latency_ms,
        } => {
            let succeeded = deploy(&config, &manifest, Duration::from_millis(latency_ms)).await?;
            if !succeeded {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::List => list(&config),
        Command::Show { deployment } => show(&config, &deployment),
        Command::Locks => locks(&config),
        Command::Orphans { forget } => orphans(&config, forget.as_deref()),
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<FleetConfig> {
    if path.exists() {
        FleetConfig::from_file(path).with_context(|| format!("reading {}", path.display()))
    } else {
        Ok(FleetConfig::default())
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn open_store(config: &FleetConfig) -> anyhow::Result<StateStore> {
    let path = &config.state.path;
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let store = StateStore::open(path).with_context(|| format!("opening {}", path.display()))?;
    info!(path = %path.display(), "state store opened");
    Ok(store)
}

async fn deploy(config: &FleetConfig, path: &Path, latency: Duration) -> anyhow::Result<bool> {
    let manifest = DeploymentManifest::from_file(path)
        .with_context(|| format!("loading manifest {}", path.display()))?;
    let store = open_store(config)?;
    let cloud = Arc::new(SimulatedCloud::new().with_latency(latency));
    let agents = Arc::new(SimulatedAgents::new().with_latency(latency));
    let engine = Engine::from_config(store, config, cloud, agents);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next step boundary");
            let _ = cancel_tx.send(true);
        }
    });

    let report = engine.converge(&manifest, cancel_rx).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.succeeded())
}

fn list(config: &FleetConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let deployments = store.list_deployments()?;
    println!("{}", serde_json::to_string_pretty(&deployments)?);
    Ok(())
}

fn show(config: &FleetConfig, name: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let deployment = store
        .get_deployment(name)?
        .with_context(|| format!("deployment {name} not found"))?;
    let instances = store.list_instances(name)?;
    let out = json!({
        "deployment": deployment,
        "instances": instances,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn locks(config: &FleetConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let locks = LockManager::new(Arc::new(store)).live_locks()?;
    println!("{}", serde_json::to_string_pretty(&locks)?);
    Ok(())
}

fn orphans(config: &FleetConfig, forget: Option<&str>) -> anyhow::Result<()> {
    let store = open_store(config)?;
    if let Some(cid) = forget {
        if !store.delete_orphaned_disk(cid)? {
            anyhow::bail!("no orphaned disk {cid}");
        }
        info!(disk = %cid, "orphaned disk forgotten");
        return Ok(());
    }
    let disks = store.list_orphaned_disks()?;
    println!("{}", serde_json::to_string_pretty(&disks)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["fleetd", "-c", "x.toml", "deploy", "cf.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        assert!(matches!(cli.command, Command::Deploy { latency_ms: 0, .. }));

        let cli = Cli::try_parse_from(["fleetd", "list"]).unwrap();
        assert!(matches!(cli.command, Command::List));

        let cli = Cli::try_parse_from(["fleetd", "orphans", "--forget", "disk-1"]).unwrap();
        assert!(matches!(cli.command, Command::Orphans { forget: Some(ref c) } if c == "disk-1"));
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let config = load_config(Path::new("/nonexistent/fleetd.toml")).unwrap();
        assert_eq!(config.agent.retries, FleetConfig::default().agent.retries);
    }
}
