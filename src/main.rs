/// Research queue server
///
/// Main entry point. Loads configuration from the environment and starts the
/// HTTP server together with the background run scheduler.

use research_queue::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Run submission at POST /threads/{thread_id}/runs
/// - Run, thread and stream endpoints at /runs/* and /threads/*
/// - Queue statistics at /queue/stats
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
