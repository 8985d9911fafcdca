/// Server setup and initialization
///
/// Wires together the run store, pipeline registry, background scheduler and HTTP
/// routes, and runs them until Ctrl-C.

use crate::{
    api::{create_run_routes, AppState},
    config::Config,
    pipeline::{PipelineRegistry, RemotePipeline},
    runtime::{RunEventHub, RunScheduler, RunWorker, SchedulerConfig},
    store::{RunStore, SqliteRunStore},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Pool connections beyond one per live attempt, for claims, heartbeats and the API
const EXTRA_CONNECTIONS: u32 = 4;

/// Build the HTTP router over an already wired application state
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        // Run submission, inspection and streaming
        .merge(create_run_routes().with_state(state))
}

/// Create the application router and the scheduler that serves it
///
/// The scheduler is returned unstarted; the caller decides where it runs.
pub async fn create_app(config: &Config) -> Result<(Router, RunScheduler)> {
    let db_path = PathBuf::from(&config.database.data_dir).join("runs.db");
    let max_connections = u32::try_from(config.queue.concurrency)
        .unwrap_or(u32::MAX - EXTRA_CONNECTIONS)
        .saturating_add(EXTRA_CONNECTIONS);

    tracing::info!("🗄️ Initializing run store");
    let store: Arc<dyn RunStore> = Arc::new(
        SqliteRunStore::open(&db_path, max_connections, config.queue.poll_interval())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open run store: {}", e))?,
    );

    tracing::info!("📊 Initializing pipeline registry");
    let registry = Arc::new(PipelineRegistry::new());
    match &config.pipeline.remote_url {
        Some(url) => {
            tracing::info!("🌍 Using remote research graph at {}", url);
            registry.register(
                config.pipeline.default_assistant.clone(),
                Arc::new(RemotePipeline::new(url.clone())),
            );
        }
        None => {
            tracing::warn!("⚠️ RESEARCH_GRAPH_URL is not set, runs will fail until a pipeline is registered");
        }
    }

    let events = Arc::new(RunEventHub::default());

    tracing::info!("⚙️ Initializing background run scheduler");
    let mut worker = RunWorker::new(
        store.clone(),
        registry.clone(),
        events.clone(),
        config.queue.run_timeout(),
        config.queue.heartbeat_interval(),
    );
    if let Some(user_id) = &config.pipeline.backup_user_id {
        worker = worker.with_backup_user(user_id.clone());
    }
    let scheduler = RunScheduler::new(store.clone(), worker, SchedulerConfig::from(&config.queue));

    let state = AppState {
        store,
        registry,
        events,
        gauge: scheduler.gauge(),
        default_assistant: config.pipeline.default_assistant.clone(),
    };

    tracing::info!("✅ Application initialized successfully");

    Ok((build_router(state), scheduler))
}

/// Start the HTTP server and the background scheduler
///
/// Returns after Ctrl-C, once the HTTP server stopped and the scheduler drained.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting research queue server...");

    let (app, scheduler) = create_app(&config).await?;

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    // Bind to the configured address
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    let signal = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            wait_for_ctrl_c().await;
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        tracing::error!("❌ Scheduler task failed: {}", e);
    }

    tracing::info!("👋 Server stopped");
    Ok(())
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("🛑 Received Ctrl-C, shutting down"),
        Err(e) => tracing::error!("❌ Failed to listen for Ctrl-C: {}", e),
    }
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
