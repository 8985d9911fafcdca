/// In-memory run store
///
/// Mirrors the SQLite store's semantics closely enough for scheduler tests and
/// single-process local runs: scope writes are buffered until commit, a failed
/// statement poisons its scope, and claims bump the attempt counter. Faults can be
/// queued per operation to drive the error paths of the execution unit.

use crate::store::{
    ClaimedRun, NewRun, QueueStats, Run, RunStatus, RunStore, StoreError, StoreResult, StoreScope,
    Thread, ThreadStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Store operation a queued fault fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Claim,
    Begin,
    Heartbeat,
    SetStatus,
    DeleteRun,
    SetThreadStatus,
    DeleteThread,
    Commit,
}

/// What happened to one run over its lifetime
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunHistory {
    /// Attempt number handed out by every claim
    pub claims: Vec<u32>,
    /// Committed status writes, in order
    pub statuses: Vec<RunStatus>,
    /// Number of times the run was reset by a sweep
    pub swept: u32,
    pub heartbeats: u32,
    pub deleted: bool,
}

#[derive(Debug)]
struct RunRecord {
    run: Run,
    attempt: u32,
    seq: u64,
    heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    runs: HashMap<Uuid, RunRecord>,
    threads: HashMap<Uuid, Thread>,
    history: HashMap<Uuid, RunHistory>,
    faults: HashMap<FaultOp, VecDeque<StoreError>>,
    next_seq: u64,
}

impl State {
    fn take_fault(&mut self, op: FaultOp) -> Option<StoreError> {
        self.faults.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn apply(&mut self, write: ScopeWrite) {
        let now = Utc::now();
        match write {
            ScopeWrite::SetStatus { run_id, status } => {
                if let Some(record) = self.runs.get_mut(&run_id) {
                    if record.run.status != status {
                        record.run.status = status;
                        record.run.updated_at = now;
                        self.history.entry(run_id).or_default().statuses.push(status);
                    }
                }
            }
            ScopeWrite::DeleteRun { run_id, thread_id } => {
                let matches = self
                    .runs
                    .get(&run_id)
                    .is_some_and(|record| record.run.thread_id == thread_id);
                if matches {
                    self.runs.remove(&run_id);
                    self.history.entry(run_id).or_default().deleted = true;
                }
            }
            ScopeWrite::SetThreadStatus {
                thread_id,
                status,
                values,
                error,
            } => {
                if let Some(thread) = self.threads.get_mut(&thread_id) {
                    thread.status = status;
                    if values.is_some() {
                        thread.values = values;
                    }
                    thread.error = error;
                    thread.updated_at = now;
                }
            }
            ScopeWrite::DeleteThread { thread_id } => {
                self.threads.remove(&thread_id);
                let run_ids: Vec<Uuid> = self
                    .runs
                    .values()
                    .filter(|record| record.run.thread_id == thread_id)
                    .map(|record| record.run.run_id)
                    .collect();
                for run_id in run_ids {
                    self.runs.remove(&run_id);
                    self.history.entry(run_id).or_default().deleted = true;
                }
            }
        }
    }
}

/// In-memory run store; clones share state
#[derive(Debug, Clone)]
pub struct MemoryRunStore {
    state: Arc<Mutex<State>>,
    work_notify: Arc<Notify>,
    poll_interval: Duration,
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl MemoryRunStore {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            work_notify: Arc::new(Notify::new()),
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an error for the next call of `op`
    pub fn fail_next(&self, op: FaultOp, err: StoreError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    pub fn history(&self, run_id: Uuid) -> RunHistory {
        self.lock().history.get(&run_id).cloned().unwrap_or_default()
    }

    /// Current attempt counter of a run, if it still exists
    pub fn attempt(&self, run_id: Uuid) -> Option<u32> {
        self.lock().runs.get(&run_id).map(|record| record.attempt)
    }

    /// Pretend the last heartbeat of a run happened `age` ago
    pub fn age_heartbeat(&self, run_id: Uuid, age: Duration) {
        let mut state = self.lock();
        if let Some(record) = state.runs.get_mut(&run_id) {
            record.heartbeat_at = before(Utc::now(), age);
        }
    }

    fn try_claim(&self) -> StoreResult<Option<ClaimedRun>> {
        let mut state = self.lock();
        if let Some(err) = state.take_fault(FaultOp::Claim) {
            return Err(err);
        }

        let next = state
            .runs
            .values()
            .filter(|record| record.run.status == RunStatus::Pending)
            .min_by_key(|record| record.seq)
            .map(|record| record.run.run_id);

        let Some(run_id) = next else {
            return Ok(None);
        };

        let now = Utc::now();
        let claimed = match state.runs.get_mut(&run_id) {
            Some(record) => {
                record.run.status = RunStatus::Running;
                record.run.updated_at = now;
                record.attempt += 1;
                record.heartbeat_at = now;
                ClaimedRun {
                    run: record.run.clone(),
                    attempt: record.attempt,
                }
            }
            None => return Ok(None),
        };
        state.history.entry(run_id).or_default().claims.push(claimed.attempt);

        Ok(Some(claimed))
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn claim_next(&self, wait: bool) -> StoreResult<Option<ClaimedRun>> {
        if let Some(claimed) = self.try_claim()? {
            return Ok(Some(claimed));
        }
        if !wait {
            return Ok(None);
        }

        let _ = tokio::time::timeout(self.poll_interval, self.work_notify.notified()).await;
        self.try_claim()
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreScope>> {
        if let Some(err) = self.lock().take_fault(FaultOp::Begin) {
            return Err(err);
        }
        Ok(Box::new(MemoryScope {
            state: self.state.clone(),
            writes: Vec::new(),
            failed: None,
        }))
    }

    async fn heartbeat(&self, run_id: Uuid) -> StoreResult<()> {
        let mut state = self.lock();
        if let Some(err) = state.take_fault(FaultOp::Heartbeat) {
            return Err(err);
        }
        let beat = match state.runs.get_mut(&run_id) {
            Some(record) if record.run.status == RunStatus::Running => {
                record.heartbeat_at = Utc::now();
                true
            }
            _ => false,
        };
        if beat {
            state.history.entry(run_id).or_default().heartbeats += 1;
        }
        Ok(())
    }

    async fn sweep(&self, stale_after: Duration) -> StoreResult<Vec<Uuid>> {
        let swept = {
            let mut state = self.lock();
            let now = Utc::now();
            let cutoff = before(now, stale_after);

            let mut swept = Vec::new();
            for record in state.runs.values_mut() {
                if record.run.status == RunStatus::Running && record.heartbeat_at < cutoff {
                    record.run.status = RunStatus::Pending;
                    record.run.updated_at = now;
                    swept.push(record.run.run_id);
                }
            }
            for run_id in &swept {
                state.history.entry(*run_id).or_default().swept += 1;
            }
            swept
        };

        if !swept.is_empty() {
            self.work_notify.notify_one();
        }
        Ok(swept)
    }

    async fn stats(&self) -> StoreResult<QueueStats> {
        let state = self.lock();
        let now = Utc::now();
        let ages = state
            .runs
            .values()
            .filter(|record| record.run.status == RunStatus::Pending)
            .map(|record| (now - record.run.created_at).num_milliseconds().max(0) as f64 / 1000.0)
            .collect();
        let n_running = state
            .runs
            .values()
            .filter(|record| record.run.status == RunStatus::Running)
            .count() as u64;

        Ok(QueueStats::from_pending_ages(ages, n_running))
    }

    async fn create_run(&self, new_run: NewRun) -> StoreResult<Run> {
        let run = {
            let mut state = self.lock();
            let now = Utc::now();

            state
                .threads
                .entry(new_run.thread_id)
                .and_modify(|thread| {
                    thread.status = ThreadStatus::Busy;
                    thread.updated_at = now;
                })
                .or_insert_with(|| Thread {
                    thread_id: new_run.thread_id,
                    status: ThreadStatus::Busy,
                    values: None,
                    error: None,
                    created_at: now,
                    updated_at: now,
                });

            let run = Run {
                run_id: Uuid::new_v4(),
                thread_id: new_run.thread_id,
                assistant_id: new_run.assistant_id,
                status: RunStatus::Pending,
                kwargs: new_run.kwargs,
                metadata: new_run.metadata,
                created_at: now,
                updated_at: now,
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            state.runs.insert(
                run.run_id,
                RunRecord {
                    run: run.clone(),
                    attempt: 0,
                    seq,
                    heartbeat_at: now,
                },
            );
            run
        };

        self.work_notify.notify_one();
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        Ok(self.lock().runs.get(&run_id).map(|record| record.run.clone()))
    }

    async fn get_thread(&self, thread_id: Uuid) -> StoreResult<Option<Thread>> {
        Ok(self.lock().threads.get(&thread_id).cloned())
    }
}

fn before(instant: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|span| instant.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug)]
enum ScopeWrite {
    SetStatus {
        run_id: Uuid,
        status: RunStatus,
    },
    DeleteRun {
        run_id: Uuid,
        thread_id: Uuid,
    },
    SetThreadStatus {
        thread_id: Uuid,
        status: ThreadStatus,
        values: Option<Value>,
        error: Option<String>,
    },
    DeleteThread {
        thread_id: Uuid,
    },
}

/// Buffered scope; nothing is visible to other readers until commit
struct MemoryScope {
    state: Arc<Mutex<State>>,
    writes: Vec<ScopeWrite>,
    failed: Option<String>,
}

impl MemoryScope {
    fn stage(&mut self, op: FaultOp, write: ScopeWrite) -> StoreResult<()> {
        if let Some(reason) = &self.failed {
            return Err(StoreError::FailedTransaction(reason.clone()));
        }

        let fault = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take_fault(op);
        if let Some(err) = fault {
            self.failed = Some(err.to_string());
            return Err(err);
        }

        self.writes.push(write);
        Ok(())
    }
}

#[async_trait]
impl StoreScope for MemoryScope {
    async fn set_status(&mut self, run_id: Uuid, status: RunStatus) -> StoreResult<()> {
        self.stage(FaultOp::SetStatus, ScopeWrite::SetStatus { run_id, status })
    }

    async fn delete_run(&mut self, run_id: Uuid, thread_id: Uuid) -> StoreResult<()> {
        self.stage(FaultOp::DeleteRun, ScopeWrite::DeleteRun { run_id, thread_id })
    }

    async fn set_thread_status(
        &mut self,
        thread_id: Uuid,
        status: ThreadStatus,
        values: Option<&Value>,
        error: Option<&str>,
    ) -> StoreResult<()> {
        self.stage(
            FaultOp::SetThreadStatus,
            ScopeWrite::SetThreadStatus {
                thread_id,
                status,
                values: values.cloned(),
                error: error.map(str::to_string),
            },
        )
    }

    async fn delete_thread(&mut self, thread_id: Uuid) -> StoreResult<()> {
        self.stage(FaultOp::DeleteThread, ScopeWrite::DeleteThread { thread_id })
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryScope { state, writes, failed } = *self;
        if let Some(reason) = failed {
            return Err(StoreError::FailedTransaction(reason));
        }

        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(err) = state.take_fault(FaultOp::Commit) {
            return Err(err);
        }
        for write in writes {
            state.apply(write);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
