//! tether: a named registry of connections to external systems.
//!
//! # Architecture Overview
//!
//! ```text
//!   config.toml ──▶ loader ──▶ Registry ◀── ConfigWatcher (reconcile on change)
//!                                 │
//!          ┌──────────┬──────────┼──────────┬──────────┐
//!          ▼          ▼          ▼          ▼          ▼
//!       sqlite      redis       amqp       http       otlp
//!      (sqlx)   (deadpool)    (lapin)  (reqwest +  (tonic
//!                                      resilience) exporters)
//!
//!   HealthMonitor ──▶ Registry::health_check ──▶ logs + metrics
//! ```
//!
//! # Commands
//! - `tether run --config <path>`: keep connections open, monitor and
//!   hot-reload them until SIGINT/SIGTERM
//! - `tether check --config <path>`: open everything once, print one health
//!   report as JSON, exit non-zero unless every connection is Ready

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use tether::config::{load_config, RegistryConfig};
use tether::health::HealthReport;
use tether::lifecycle::{self, Shutdown};
use tether::observability::{logging, metrics};
use tether::registry::Registry;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "tether", version)]
#[command(about = "Named connections to databases, caches, brokers and HTTP peers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open every configured connection and keep it healthy until signalled
    Run {
        #[arg(short, long, default_value = "tether.toml")]
        config: PathBuf,
    },
    /// Run one health check over every configured connection
    Check {
        #[arg(short, long, default_value = "tether.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { config } => run(config).await,
        Command::Check { config } => check(config).await,
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            eprintln!("tether: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_observability(config: &RegistryConfig) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&config.observability)?;

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }
    Ok(())
}

async fn run(path: PathBuf) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = load_config(&path)?;
    init_observability(&config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        connections = config.connections.len(),
        "tether starting"
    );

    let shutdown = Shutdown::new();
    let services = lifecycle::start(config, Some(path.as_path()), &shutdown).await?;

    let signal = lifecycle::wait_for_signal().await?;
    tracing::info!(signal = signal, "Signal received, shutting down");

    services.stop(&shutdown, SHUTDOWN_GRACE).await?;
    tracing::info!("Shutdown complete");
    Ok(ExitCode::SUCCESS)
}

async fn check(path: PathBuf) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = load_config(&path)?;
    logging::init(&config.observability)?;

    let registry = Registry::builder()
        .with_default_factories()
        .health_timeout(Duration::from_secs(config.health_monitor.timeout_secs.max(1)))
        .build();
    let loaded = registry.load_from_config(&config).await;

    let report = HealthReport::new(registry.health_check().await);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Err(e) = registry.close().await {
        tracing::warn!(error = %e, "Close after check was incomplete");
    }
    loaded?;

    Ok(if report.healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
