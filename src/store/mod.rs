/// Durable run store
///
/// The scheduler only depends on the narrow contract below:
/// - `RunStore`: claim work, open per-attempt scopes, heartbeat, sweep, stats
/// - `StoreScope`: the transaction an execution unit writes its outcome through
///
/// Two implementations ship with the crate: SQLite (sqlx) for deployments and an
/// in-memory store for tests and local runs.

// Record types shared by every store implementation
pub mod types;

// sqlx/SQLite implementation
pub mod sqlite;

// In-memory implementation with fault injection
pub mod memory;

pub use memory::MemoryRunStore;
pub use sqlite::SqliteRunStore;
pub use types::{ClaimedRun, NewRun, QueueStats, Run, RunStatus, Thread, ThreadStatus};

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Errors raised by run store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connectivity or contention problem that is expected to clear on retry
    #[error("transient store failure: {0}")]
    Transient(String),

    /// An earlier statement in the same scope failed; the scope must be abandoned
    #[error("current transaction is aborted: {0}")]
    FailedTransaction(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error(transparent)]
    Database(sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Transient failures requeue the run instead of failing it
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_failed_transaction(&self) -> bool {
        matches!(self, Self::FailedTransaction(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Transient(err.to_string()),
            sqlx::Error::Database(db_err) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
                let busy = db_err
                    .code()
                    .and_then(|code| code.parse::<i64>().ok())
                    .map(|code| matches!(code & 0xff, 5 | 6))
                    .unwrap_or(false);
                if busy {
                    Self::Transient(err.to_string())
                } else {
                    Self::Database(err)
                }
            }
            _ => Self::Database(err),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Queue side of the store: used by the scheduler loop and the HTTP surface
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    /// Atomically move one pending run to `running` and return it with its attempt number.
    ///
    /// With `wait` set the call may block briefly for new work before returning `None`.
    async fn claim_next(&self, wait: bool) -> StoreResult<Option<ClaimedRun>>;

    /// Open the transactional scope one attempt writes its outcome through.
    ///
    /// Dropping the scope without [`StoreScope::commit`] discards its writes.
    async fn begin(&self) -> StoreResult<Box<dyn StoreScope>>;

    /// Record liveness of a running attempt
    async fn heartbeat(&self, run_id: Uuid) -> StoreResult<()>;

    /// Reset runs stuck in `running` longer than `stale_after` back to `pending`
    async fn sweep(&self, stale_after: Duration) -> StoreResult<Vec<Uuid>>;

    async fn stats(&self) -> StoreResult<QueueStats>;

    /// Insert a pending run, creating its thread if needed and marking it busy
    async fn create_run(&self, new_run: NewRun) -> StoreResult<Run>;

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>>;

    async fn get_thread(&self, thread_id: Uuid) -> StoreResult<Option<Thread>>;
}

/// Per-attempt transaction
#[async_trait]
pub trait StoreScope: Send {
    /// Idempotent status write
    async fn set_status(&mut self, run_id: Uuid, status: RunStatus) -> StoreResult<()>;

    async fn delete_run(&mut self, run_id: Uuid, thread_id: Uuid) -> StoreResult<()>;

    async fn set_thread_status(
        &mut self,
        thread_id: Uuid,
        status: ThreadStatus,
        values: Option<&Value>,
        error: Option<&str>,
    ) -> StoreResult<()>;

    async fn delete_thread(&mut self, thread_id: Uuid) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
