//! mixscope-analyzer - audio mix analysis service
//!
//! Accepts analysis jobs over HTTP, persists them, and runs the DSP pipeline on a
//! pool of workers that survives crashes through lease expiry and orphan recovery.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

use mixscope_analyzer::pipeline::{decoder_from_config, AnalysisPipeline, PipelineOptions};
use mixscope_analyzer::queue::SqliteQueue;
use mixscope_analyzer::services::{
    spawn_recovery_sweep, JobRunner, Orchestrator, OrchestratorSettings, WorkerPool,
    WorkerSettings,
};
use mixscope_analyzer::AppState;
use mixscope_common::config::{load_toml_config, RootFolderInitializer, RootFolderResolver, TomlConfig};
use mixscope_common::events::EventBus;

/// Command-line arguments for mixscope-analyzer
#[derive(Parser, Debug)]
#[command(name = "mixscope-analyzer")]
#[command(about = "Audio mix analysis service")]
#[command(version)]
struct Args {
    /// Root folder holding the job database
    #[arg(short, long, env = "MIXSCOPE_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Explicit config file instead of the platform location
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_toml_config(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TomlConfig::load_or_default(),
    };
    config.apply_env_overrides();
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }

    // RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "mixscope_analyzer={0},mixscope_common={0},tower_http=info",
            config.logging.level
        ))
    });
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting mixscope-analyzer");
    info!(
        "Version: {} ({}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_PROFILE")
    );

    // Root folder and database
    let root_folder = RootFolderResolver::new(args.root_folder.clone(), &config).resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = mixscope_analyzer::db::init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;

    // Orchestration
    let event_bus = EventBus::new(config.server.event_capacity);
    let queue = Arc::new(SqliteQueue::new(db_pool.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        db_pool.clone(),
        queue,
        event_bus,
        OrchestratorSettings::from_config(&config.worker, &config.recovery),
    ));

    let pipeline = Arc::new(AnalysisPipeline::new(
        decoder_from_config(&config.pipeline),
        PipelineOptions::from_config(&config.pipeline),
    ));
    let runner = Arc::new(JobRunner::new(
        pipeline,
        db_pool.clone(),
        config.pipeline.job_budget(),
    ));

    let shutdown = CancellationToken::new();

    // Sweep once before workers start so jobs orphaned by a previous crash are requeued
    match orchestrator.recover_orphans().await {
        Ok(report) => info!(
            recovered = report.recovered.len(),
            quarantined = report.quarantined.len(),
            "Startup orphan sweep complete"
        ),
        Err(e) => tracing::warn!(error = %e, "Startup orphan sweep failed"),
    }

    let workers = WorkerPool::spawn(
        Arc::clone(&orchestrator),
        runner,
        WorkerSettings::from_config(&config.worker),
        shutdown.clone(),
    );
    let sweep = spawn_recovery_sweep(
        Arc::clone(&orchestrator),
        config.recovery.sweep_interval(),
        shutdown.clone(),
    );

    // HTTP
    let app = mixscope_analyzer::build_router(AppState::new(orchestrator));
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    // Workers finish their current job; an interrupted one is recovered on next start
    shutdown.cancel();
    workers.join().await;
    if let Err(e) = sweep.await {
        tracing::warn!(error = %e, "Recovery sweep task ended abnormally");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
