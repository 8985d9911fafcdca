/// Research queue: background run scheduler for deep research pipelines
///
/// Runs are submitted over HTTP, persisted in a durable store, and executed by a
/// bounded pool of background attempts that stream events from a research pipeline.

// Core configuration and setup
pub mod config;

// Durable run store contract and implementations
pub mod store;

// Pipeline contract, registry and remote pipeline
pub mod pipeline;

// Scheduler loop, execution unit, webhooks
pub mod runtime;

// HTTP API layer
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use pipeline::{Pipeline, PipelineEvent, PipelineRegistry};
pub use runtime::{RunError, RunScheduler, RunWorker, WorkerResult};
pub use server::start_server;
pub use store::{MemoryRunStore, RunStore, SqliteRunStore};
