/// SQLite persistence layer for the run queue
///
/// Runs and threads live in a single `runs.db`. Claims are a single
/// UPDATE ... RETURNING statement, so two concurrent claimers can never both win
/// the same row. Timestamps are stored as unix milliseconds.

use crate::store::{
    ClaimedRun, NewRun, QueueStats, Run, RunStatus, RunStore, StoreError, StoreResult, StoreScope,
    Thread, ThreadStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row, Sqlite, Transaction,
};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::Notify;
use uuid::Uuid;

const RUN_COLUMNS: &str =
    "run_id, thread_id, assistant_id, status, kwargs, metadata, attempt, created_at, updated_at";

/// SQLite-backed run store
///
/// Clones share the pool and the wake-up signal used by waiting claims.
#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    /// SQLite connection pool for the run database
    pool: SqlitePool,
    /// Wakes a waiting claim as soon as a run is submitted in-process
    work_notify: Arc<Notify>,
    /// Upper bound on a waiting claim
    poll_interval: Duration,
}

impl SqliteRunStore {
    /// Open (or create) the run database at `path`
    ///
    /// Every live attempt holds one connection for its scope, so `max_connections`
    /// must leave headroom above the scheduler concurrency.
    pub async fn open(path: &Path, max_connections: u32, poll_interval: Duration) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Transient(format!("failed to create '{}': {}", parent.display(), e)))?;
        }

        tracing::info!("🗄️ Opening run store: {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(2))
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            work_notify: Arc::new(Notify::new()),
            poll_interval,
        };
        store.init_schema().await?;

        Ok(store)
    }

    /// Create the runs and threads tables
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                values_json TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                assistant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                kwargs TEXT NOT NULL,
                metadata TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                heartbeat_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Claim order and sweep both filter on status
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_status_created ON runs(status, created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_thread ON runs(thread_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn try_claim(&self) -> StoreResult<Option<ClaimedRun>> {
        let now = now_millis();
        let sql = format!(
            r#"
            UPDATE runs
            SET status = 'running', attempt = attempt + 1, updated_at = ?1, heartbeat_at = ?1
            WHERE run_id = (
                SELECT run_id FROM runs
                WHERE status = 'pending'
                ORDER BY created_at, rowid
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {RUN_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql).bind(now).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => {
                let attempt: i64 = row.try_get("attempt")?;
                Ok(Some(ClaimedRun {
                    run: run_from_row(&row)?,
                    attempt: u32::try_from(attempt)
                        .map_err(|_| StoreError::Corrupt(format!("attempt out of range: {attempt}")))?,
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn claim_next(&self, wait: bool) -> StoreResult<Option<ClaimedRun>> {
        if let Some(claimed) = self.try_claim().await? {
            return Ok(Some(claimed));
        }
        if !wait {
            return Ok(None);
        }

        // Event-driven wakeup for in-process submissions, polling fallback otherwise
        let _ = tokio::time::timeout(self.poll_interval, self.work_notify.notified()).await;
        self.try_claim().await
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreScope>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteScope { tx, failed: None }))
    }

    async fn heartbeat(&self, run_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE runs SET heartbeat_at = ? WHERE run_id = ? AND status = 'running'")
            .bind(now_millis())
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep(&self, stale_after: Duration) -> StoreResult<Vec<Uuid>> {
        let now = now_millis();
        let cutoff = now - i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'pending', updated_at = ?
            WHERE status = 'running' AND COALESCE(heartbeat_at, updated_at) < ?
            RETURNING run_id
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let run_ids = rows
            .iter()
            .map(|row| -> StoreResult<Uuid> { parse_uuid(row.try_get::<String, _>("run_id")?) })
            .collect::<StoreResult<Vec<_>>>()?;

        if !run_ids.is_empty() {
            self.work_notify.notify_one();
        }

        Ok(run_ids)
    }

    async fn stats(&self) -> StoreResult<QueueStats> {
        let now = now_millis();
        let pending = sqlx::query("SELECT created_at FROM runs WHERE status = 'pending'")
            .fetch_all(&self.pool)
            .await?;
        let ages = pending
            .iter()
            .map(|row| -> StoreResult<f64> {
                let created_at: i64 = row.try_get("created_at")?;
                Ok((now - created_at).max(0) as f64 / 1000.0)
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let n_running: i64 = sqlx::query("SELECT COUNT(*) AS n FROM runs WHERE status = 'running'")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        Ok(QueueStats::from_pending_ages(ages, n_running.max(0) as u64))
    }

    async fn create_run(&self, new_run: NewRun) -> StoreResult<Run> {
        let now = now_millis();
        let run_id = Uuid::new_v4();
        let kwargs_json = serde_json::to_string(&new_run.kwargs)?;
        let metadata_json = serde_json::to_string(&new_run.metadata)?;

        let mut tx = self.pool.begin().await?;

        // Submitting a run marks its thread busy, creating it on first use
        sqlx::query(
            r#"
            INSERT INTO threads (thread_id, status, created_at, updated_at)
            VALUES (?, 'busy', ?, ?)
            ON CONFLICT(thread_id) DO UPDATE SET
                status = 'busy',
                updated_at = excluded.updated_at
            "#,
        )
        .bind(new_run.thread_id.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO runs (run_id, thread_id, assistant_id, status, kwargs, metadata, attempt, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?, 0, ?, ?)
            "#,
        )
        .bind(run_id.to_string())
        .bind(new_run.thread_id.to_string())
        .bind(&new_run.assistant_id)
        .bind(&kwargs_json)
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.work_notify.notify_one();

        let created_at = from_millis(now)?;
        Ok(Run {
            run_id,
            thread_id: new_run.thread_id,
            assistant_id: new_run.assistant_id,
            status: RunStatus::Pending,
            kwargs: new_run.kwargs,
            metadata: new_run.metadata,
            created_at,
            updated_at: created_at,
        })
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?");
        let row = sqlx::query(&sql)
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn get_thread(&self, thread_id: Uuid) -> StoreResult<Option<Thread>> {
        let row = sqlx::query(
            "SELECT thread_id, status, values_json, error, created_at, updated_at FROM threads WHERE thread_id = ?",
        )
        .bind(thread_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(thread_from_row).transpose()
    }
}

/// One attempt's transaction
///
/// A failed statement poisons the scope: later statements report
/// [`StoreError::FailedTransaction`] until the scope is dropped or rolled back.
struct SqliteScope {
    tx: Transaction<'static, Sqlite>,
    failed: Option<String>,
}

impl SqliteScope {
    fn ensure_usable(&self) -> StoreResult<()> {
        match &self.failed {
            Some(reason) => Err(StoreError::FailedTransaction(reason.clone())),
            None => Ok(()),
        }
    }

    fn track<T>(&mut self, result: Result<T, sqlx::Error>) -> StoreResult<T> {
        result.map_err(|err| {
            self.failed = Some(err.to_string());
            StoreError::from(err)
        })
    }
}

#[async_trait]
impl StoreScope for SqliteScope {
    async fn set_status(&mut self, run_id: Uuid, status: RunStatus) -> StoreResult<()> {
        self.ensure_usable()?;
        // Writing the current status again leaves the row untouched
        let result = sqlx::query("UPDATE runs SET status = ?, updated_at = ? WHERE run_id = ? AND status != ?")
            .bind(status.as_str())
            .bind(now_millis())
            .bind(run_id.to_string())
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await;
        self.track(result).map(|_| ())
    }

    async fn delete_run(&mut self, run_id: Uuid, thread_id: Uuid) -> StoreResult<()> {
        self.ensure_usable()?;
        let result = sqlx::query("DELETE FROM runs WHERE run_id = ? AND thread_id = ?")
            .bind(run_id.to_string())
            .bind(thread_id.to_string())
            .execute(&mut *self.tx)
            .await;
        self.track(result).map(|_| ())
    }

    async fn set_thread_status(
        &mut self,
        thread_id: Uuid,
        status: ThreadStatus,
        values: Option<&Value>,
        error: Option<&str>,
    ) -> StoreResult<()> {
        self.ensure_usable()?;
        let values_json = values.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE threads
            SET status = ?, values_json = COALESCE(?, values_json), error = ?, updated_at = ?
            WHERE thread_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(values_json)
        .bind(error)
        .bind(now_millis())
        .bind(thread_id.to_string())
        .execute(&mut *self.tx)
        .await;
        self.track(result).map(|_| ())
    }

    async fn delete_thread(&mut self, thread_id: Uuid) -> StoreResult<()> {
        self.ensure_usable()?;
        let result = sqlx::query("DELETE FROM runs WHERE thread_id = ?")
            .bind(thread_id.to_string())
            .execute(&mut *self.tx)
            .await;
        self.track(result)?;

        let result = sqlx::query("DELETE FROM threads WHERE thread_id = ?")
            .bind(thread_id.to_string())
            .execute(&mut *self.tx)
            .await;
        self.track(result).map(|_| ())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let SqliteScope { tx, failed } = *self;
        if let Some(reason) = failed {
            tx.rollback().await?;
            return Err(StoreError::FailedTransaction(reason));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn run_from_row(row: &SqliteRow) -> StoreResult<Run> {
    let status: String = row.try_get("status")?;
    let kwargs: String = row.try_get("kwargs")?;
    let metadata: String = row.try_get("metadata")?;

    let kwargs = match serde_json::from_str::<Value>(&kwargs)? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => return Err(StoreError::Corrupt(format!("run kwargs must be an object, got {other}"))),
    };

    Ok(Run {
        run_id: parse_uuid(row.try_get("run_id")?)?,
        thread_id: parse_uuid(row.try_get("thread_id")?)?,
        assistant_id: row.try_get("assistant_id")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        kwargs,
        metadata: serde_json::from_str(&metadata)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn thread_from_row(row: &SqliteRow) -> StoreResult<Thread> {
    let status: String = row.try_get("status")?;
    let values: Option<String> = row.try_get("values_json")?;

    Ok(Thread {
        thread_id: parse_uuid(row.try_get("thread_id")?)?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        values: values.as_deref().map(serde_json::from_str).transpose()?,
        error: row.try_get("error")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn parse_uuid(value: String) -> StoreResult<Uuid> {
    Uuid::parse_str(&value).map_err(|e| StoreError::Corrupt(format!("invalid uuid '{value}': {e}")))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {millis}")))
}
