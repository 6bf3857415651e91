//! db-backup-server - main entry point

use anyhow::Context;
use clap::Parser;
use db_backup_server::config::AppConfig;
use db_backup_server::db::connection::{close_pool, create_pool};
use db_backup_server::db::migrate::migrate;
use db_backup_server::services::db_backup::backup_database;
use db_backup_server::services::scheduler::Scheduler;
use db_backup_server::state::AppState;
use db_backup_server::{routes, utils};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    utils::logger::init(&config.log_level)?;
    tracing::info!("Starting db-backup-server v{}", env!("CARGO_PKG_VERSION"));

    // Ensure data directories exist
    std::fs::create_dir_all(&config.backup_dir)
        .with_context(|| format!("failed to create {}", config.backup_dir.display()))?;
    std::fs::create_dir_all(&config.download_dir)
        .with_context(|| format!("failed to create {}", config.download_dir.display()))?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Initialize database
    let pool = create_pool(&config.db_path).context("failed to open tracking database")?;
    migrate(&pool).context("failed to migrate tracking database")?;

    // Daily database copy
    if let Err(e) = backup_database(&pool, &config.db_path, chrono::Local::now().date_naive()) {
        tracing::warn!(error = %e, "Failed to create database copy");
    }

    let state = Arc::new(AppState::new(pool, config.clone()));

    let cancel = CancellationToken::new();
    let scheduler = Scheduler::start(state.clone(), cancel.clone());

    let app = routes::create_router(state.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    tokio::spawn(shutdown_signal(cancel.clone()));
    routes::serve(listener, app, cancel.clone(), config.shutdown_grace).await?;

    tracing::info!("Shutting down...");
    cancel.cancel();
    scheduler.shutdown(config.shutdown_grace).await;
    state.transfers.shutdown(config.shutdown_grace).await;

    close_pool(state.tracker.db());
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}
