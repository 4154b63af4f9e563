use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tempo_config::{ConfigLoad, ConfigLoader, TempoConfig};
use tempo_core::HandlerRegistry;
use tempo_server::{api, bootstrap, handlers};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "tempo-server")]
#[command(about = "Distributed task orchestration worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to tempo.toml (overrides TEMPO_CONFIG and default locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file to load before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Operational API bind address (overrides config)
    #[arg(long, env = "TEMPO_HTTP_ADDR")]
    http_addr: Option<SocketAddr>,

    /// Skip applying database migrations on startup
    #[arg(long, default_value_t = false)]
    no_migrate: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply database migrations and exit
    Migrate,
    /// Print the resolved configuration warnings and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,tempo::queue=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_config(&cli)?;
    if let Some(addr) = cli.http_addr {
        config.server.http_addr = addr;
    }

    match cli.command {
        Some(Command::Migrate) => bootstrap::migrate(&config).await,
        Some(Command::CheckConfig) => {
            info!(
                store = %config.backends.store,
                locks = %config.backends.locks,
                slots = config.engine.executor.slots,
                seeds = config.triggers.len(),
                "configuration is valid"
            );
            Ok(())
        }
        None => run_worker(config, !cli.no_migrate).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<TempoConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad { config, warnings } =
        loader.load().context("failed to load configuration")?;

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }
    Ok(config)
}

async fn run_worker(config: TempoConfig, auto_migrate: bool) -> anyhow::Result<()> {
    let registry = HandlerRegistry::new();
    handlers::register_builtin(&registry);

    let backends = bootstrap::connect_backends(&config, auto_migrate).await?;
    let engine = Arc::new(bootstrap::build_engine(&config, backends, registry).await?);
    engine.start().await.context("failed to start engine")?;

    let listener = tokio::net::TcpListener::bind(config.server.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.http_addr))?;
    info!(
        addr = %config.server.http_addr,
        worker = %engine.worker_id(),
        "operational API listening"
    );

    let served = axum::serve(listener, api::router(Arc::clone(&engine)))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(err) = &served {
        error!(error = %err, "operational API stopped with an error");
    }

    engine.shutdown().await;
    info!("worker stopped");
    served.context("HTTP server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
