//! vreg - pull-through cache for Maven, npm and container registries

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use config::Config;
use vreg_api::{AppState, create_router};
use vreg_core::{
    CleanupService, DownloadCounter, JobQueue, JobRunner, spawn_cleanup_scheduler,
    spawn_reclaimer, spawn_workers,
};
use vreg_db::Database;
use vreg_proxy::UpstreamClient;
use vreg_storage::{LocalStorage, MemoryStorage, StorageBackend};

/// vreg - virtual package registry cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "VREG_CONFIG", default_value = "config/default.toml")]
    config: String,

    /// Bind address
    #[arg(long, env = "VREG_BIND")]
    bind: Option<String>,

    /// Port
    #[arg(short, long, env = "VREG_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    init_logging(&config.logging.level, &config.logging.format);

    info!("Starting vreg v{}", env!("CARGO_PKG_VERSION"));

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    // Database
    if let Some(parent) = Path::new(&config.database.path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let db = Database::new(&config.database_url()).await?;

    // Storage
    let storage: Arc<dyn StorageBackend> = match config.storage.backend.as_str() {
        "memory" => {
            warn!("Using in-memory storage, cached files will not survive a restart");
            Arc::new(MemoryStorage::new())
        }
        _ => Arc::new(LocalStorage::new(&config.storage.local.path).await?),
    };

    let client = Arc::new(UpstreamClient::new(config.client_config())?);
    let settings = config.core_settings();

    // Jobs
    let (queue, receiver) = JobQueue::new();
    let counter = Arc::new(DownloadCounter::new(
        queue.clone(),
        settings.counter_flush_delay,
    ));
    let runner = Arc::new(JobRunner::new(
        db.clone(),
        storage,
        client,
        queue.clone(),
        counter,
        settings.clone(),
    ));

    let mut tasks = spawn_workers(runner, receiver, config.jobs.workers);
    tasks.push(spawn_cleanup_scheduler(
        CleanupService::new(db.clone(), settings),
        queue.clone(),
        Duration::from_secs(config.jobs.cleanup_scheduler_interval_secs),
    ));
    tasks.push(spawn_reclaimer(
        queue.clone(),
        Duration::from_secs(config.jobs.reclaim_interval_secs),
    ));
    info!("Started {} job workers", config.jobs.workers);

    // Ops server
    let app = create_router(AppState::new(db, queue.clone()), Some(Arc::new(metrics_handle)));

    let bind_addr = args.bind.unwrap_or(config.server.bind_address);
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", bind_addr, port).parse()?;

    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let pending = queue.pending();
    if pending > 0 {
        warn!("Stopping with {} jobs still pending", pending);
    }
    for task in tasks {
        task.abort();
    }

    info!("Server stopped");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
