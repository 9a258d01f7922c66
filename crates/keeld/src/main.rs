//! keeld: the Keel daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Command-backed provisioner and remote executor
//! - Orchestrator (placement, lifecycle, convergence)
//! - REST API
//!
//! # Usage
//!
//! ```text
//! keeld serve --config /etc/keel/keeld.toml --port 8080 --data-dir /var/lib/keel
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keel_lifecycle::{CommandExecutor, CommandProvisioner};
use keel_orchestrator::Orchestrator;
use keel_state::StateStore;

use crate::config::KeelConfig;

const DEFAULT_FILTER: &str = "info,keeld=debug,keel=debug";

#[derive(Parser)]
#[command(name = "keeld", about = "Keel control plane daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the REST API.
    Serve {
        /// Path to keeld.toml.
        #[arg(long, default_value = "/etc/keel/keeld.toml")]
        config: PathBuf,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let mut config = KeelConfig::from_file(&config)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            serve(config).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn serve(config: KeelConfig) -> anyhow::Result<()> {
    info!("Keel daemon starting");

    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("keel.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let provisioner = Arc::new(CommandProvisioner::new(config.provisioner.clone()));
    let executor = Arc::new(CommandExecutor::new(
        config.executor.clone(),
        config.controller.fqdn.clone(),
    ));
    info!(
        provisioner = %config.provisioner.program,
        executor = %config.executor.program,
        "capabilities configured"
    );

    let orchestrator = Orchestrator::new(
        store,
        provisioner,
        executor,
        config.timeouts.lifecycle(),
    );

    let router = keel_api::build_router(Arc::new(orchestrator));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("Keel daemon stopped");
    Ok(())
}
