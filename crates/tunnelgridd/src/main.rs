//! tunnelgridd: the TunnelGrid daemon.
//!
//! Runs the edge overlay control plane:
//! - Subnet allocation for edge nodes
//! - Per-node tunnel documents, credentials, and agent workloads
//! - The connector loop for the cloud side
//! - Community membership
//!
//! # Usage
//!
//! ```text
//! tunnelgridd run --config /etc/tunnelgrid/operator.toml --seed cluster.yaml
//! tunnelgridd check-config --config /etc/tunnelgrid/operator.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tunnelgrid_cluster::{ClusterClient, MemoryCluster};
use tunnelgrid_core::OperatorConfig;
use tunnelgridd::control_plane::describe_edge_selector;
use tunnelgridd::{ClusterSeed, ControlPlane, load_ca};

const DEFAULT_LOG_FILTER: &str = "info,tunnelgrid=debug";

#[derive(Parser)]
#[command(name = "tunnelgridd", about = "TunnelGrid edge overlay control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane against an in-process cluster.
    Run {
        /// Operator configuration file (TOML).
        #[arg(long)]
        config: PathBuf,

        /// Nodes and communities to load into the cluster at start (YAML).
        #[arg(long)]
        seed: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a configuration file and print it with defaults filled in.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            seed,
            log_json,
        } => {
            init_tracing(log_json);
            run(config, seed).await
        }
        Command::CheckConfig { config } => {
            init_tracing(false);
            let config = OperatorConfig::from_file(&config)?;
            config.validate()?;
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config_path: PathBuf, seed: Option<PathBuf>) -> anyhow::Result<()> {
    let config = OperatorConfig::from_file(&config_path)?;
    info!(
        path = %config_path.display(),
        cluster = %config.cluster_name,
        namespace = %config.namespace,
        edge_selector = %describe_edge_selector(&config),
        "TunnelGrid daemon starting"
    );

    let ca = Arc::new(load_ca(&config.certs)?);

    let memory = MemoryCluster::new();
    if let Some(path) = seed {
        ClusterSeed::from_file(&path)?.apply(&memory);
        info!(path = %path.display(), "cluster seeded");
    } else {
        warn!("no seed file given, cluster starts empty");
    }
    let cluster: Arc<dyn ClusterClient> = Arc::new(memory);

    let plane = ControlPlane::new(config, cluster, ca)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => warn!(error = %e, "unable to listen for ctrl-c, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    plane.run(shutdown_rx).await?;

    info!("TunnelGrid daemon stopped");
    Ok(())
}
