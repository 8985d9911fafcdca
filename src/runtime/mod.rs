/// Background run runtime
///
/// Everything between a pending run in the store and its terminal status:
/// - the scheduler loop bounding concurrent attempts
/// - the execution unit driving one attempt through a pipeline
/// - error classification, auth context, live events and webhooks

// Scheduler loop, admission gate and housekeeping
pub mod scheduler;

// Execution unit for a single attempt
pub mod worker;

// Closed error taxonomy and classification
pub mod error;

// Task-local identity for the attempt
pub mod auth;

// Per-run live event channels
pub mod events;

// Completion webhooks
pub mod webhook;

// Re-export main types
pub use error::{classify, ErrorClass, RunError};
pub use events::{RunEvent, RunEventHub};
pub use scheduler::{RunScheduler, SchedulerConfig, WorkerGauge, WorkerStats};
pub use webhook::WebhookDispatcher;
pub use worker::{CheckpointSink, RunWorker, WorkerResult, MAX_RETRY_ATTEMPTS};
