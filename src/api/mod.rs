/// HTTP API Layer
///
/// REST endpoints for submitting background runs and inspecting their progress:
/// - Run submission per thread
/// - Run and thread records
/// - Live run events over server-sent events
/// - Queue and worker statistics

// Run, thread, stream and stats endpoints
pub mod runs;

// Re-export router builder and state
pub use runs::{create_run_routes, AppState};
