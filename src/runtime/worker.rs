/// Execution unit for background runs
///
/// Executes exactly one attempt of one run:
/// - opens a store scope that every status write of the attempt goes through
/// - drains the pipeline's event stream under the run timeout, heartbeating as it goes
/// - maps the outcome onto the run state machine and finalizes the thread
///
/// External cancellation is deliberately not intercepted. An aborted attempt drops
/// its scope, the transaction rolls back and the run stays `running` until the
/// sweep hands it back to the queue.

use crate::pipeline::{Checkpoint, PipelineEvent, PipelineRegistry, RunContext, TaskResult};
use crate::runtime::{
    auth::{self, AuthUser},
    error::{ErrorClass, RunError},
    events::RunEventHub,
};
use crate::store::{ClaimedRun, Run, RunStatus, RunStore, ThreadStatus};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Attempts beyond this fail without invoking the pipeline
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Outcome of one finished attempt, consumed once by the scheduler
#[derive(Debug)]
pub struct WorkerResult {
    /// Run as executed, webhook target removed
    pub run: Run,
    pub attempt: u32,
    pub status: RunStatus,
    pub run_started_at: DateTime<Utc>,
    pub run_ended_at: DateTime<Utc>,
    /// Final checkpoint; always `None` after a rollback
    pub checkpoint: Option<Checkpoint>,
    pub error: Option<RunError>,
    pub webhook: Option<String>,
}

/// Owned checkpoint capture for one attempt
#[derive(Debug, Default)]
pub struct CheckpointSink {
    enabled: bool,
    latest: Option<Checkpoint>,
}

impl CheckpointSink {
    /// A disabled sink ignores everything (temporary runs keep no state)
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            latest: None,
        }
    }

    pub fn checkpoint(&mut self, checkpoint: Checkpoint) {
        if self.enabled {
            self.latest = Some(checkpoint);
        }
    }

    pub fn task_result(&mut self, result: &TaskResult) {
        if let Some(latest) = self.latest.as_mut() {
            latest.merge_task_result(result);
        }
    }

    pub fn into_inner(self) -> Option<Checkpoint> {
        self.latest
    }
}

/// Thread status after an attempt
pub fn thread_status_for(checkpoint: Option<&Checkpoint>, error: Option<&RunError>) -> ThreadStatus {
    match error.map(RunError::class) {
        Some(ErrorClass::Interrupt) => ThreadStatus::Interrupted,
        Some(ErrorClass::Rollback) | None => {
            if checkpoint.is_some_and(Checkpoint::is_paused) {
                ThreadStatus::Interrupted
            } else {
                ThreadStatus::Idle
            }
        }
        Some(_) => ThreadStatus::Error,
    }
}

/// Executes claimed runs; cheap to clone into every spawned attempt
#[derive(Clone)]
pub struct RunWorker {
    store: Arc<dyn RunStore>,
    pipelines: Arc<PipelineRegistry>,
    events: Arc<RunEventHub>,
    run_timeout: Duration,
    heartbeat_interval: Duration,
    backup_user_id: Option<String>,
}

impl RunWorker {
    pub fn new(
        store: Arc<dyn RunStore>,
        pipelines: Arc<PipelineRegistry>,
        events: Arc<RunEventHub>,
        run_timeout: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            pipelines,
            events,
            run_timeout,
            // interval() rejects a zero period
            heartbeat_interval: heartbeat_interval.max(Duration::from_millis(10)),
            backup_user_id: None,
        }
    }

    /// Identity used for runs that carry no auth context
    pub fn with_backup_user(mut self, user_id: impl Into<String>) -> Self {
        self.backup_user_id = Some(user_id.into());
        self
    }

    pub fn run_timeout(&self) -> Duration {
        self.run_timeout
    }

    /// Execute one attempt.
    ///
    /// Returns `Err` for retriable failures (the run is back to `pending`) and for
    /// store failures while recording the outcome.
    pub async fn execute(&self, claimed: ClaimedRun) -> Result<WorkerResult, RunError> {
        let run_id = claimed.run.run_id;
        let result = self.execute_attempt(claimed).await;

        let final_status = match &result {
            Ok(result) => result.status,
            Err(err) if err.class() == ErrorClass::Retriable => RunStatus::Pending,
            Err(_) => RunStatus::Error,
        };
        self.events.finish(run_id, final_status.as_str());

        result
    }

    async fn execute_attempt(&self, claimed: ClaimedRun) -> Result<WorkerResult, RunError> {
        let ClaimedRun { mut run, attempt } = claimed;
        let webhook = run.take_webhook();
        let temporary = run.is_temporary();
        let run_id = run.run_id;
        let thread_id = run.thread_id;

        let run_started_at = Utc::now();
        let started = Instant::now();
        let run_queue_ms = (run_started_at - run.created_at).num_milliseconds().max(0);
        let user = AuthUser::from_kwargs(&run.kwargs, self.backup_user_id.as_deref());

        let mut scope = self.store.begin().await?;

        self.events.publish(
            run_id,
            "metadata",
            json!({ "run_id": run_id, "attempt": attempt }),
        );

        let mut sink = CheckpointSink::new(!temporary);

        let outcome = if attempt > MAX_RETRY_ATTEMPTS {
            Err(RunError::AttemptsExceeded {
                run_id,
                max: MAX_RETRY_ATTEMPTS,
            })
        } else {
            tracing::info!(
                %run_id,
                run_attempt = attempt,
                run_created_at = %run.created_at,
                run_started_at = %run_started_at,
                run_queue_ms,
                "🚀 Starting background run"
            );
            let ctx = RunContext {
                run: run.clone(),
                attempt,
                user: user.clone(),
            };
            auth::scope(user, self.consume(ctx, &mut sink)).await
        };

        let run_ended_at = Utc::now();
        let run_exec_ms = started.elapsed().as_millis() as u64;
        let mut checkpoint = sink.into_inner();

        let (status, error) = match outcome {
            Ok(()) => {
                tracing::info!(%run_id, run_attempt = attempt, run_exec_ms, run_queue_ms, "✅ Background run succeeded");
                scope.set_status(run_id, RunStatus::Success).await?;
                (RunStatus::Success, None)
            }
            Err(err) => match err.class() {
                ErrorClass::Timeout => {
                    tracing::warn!(%run_id, run_attempt = attempt, run_exec_ms, run_queue_ms, "⏱️ Background run timed out");
                    scope.set_status(run_id, RunStatus::Timeout).await?;
                    (RunStatus::Timeout, Some(err))
                }
                ErrorClass::Rollback => {
                    tracing::info!(%run_id, run_attempt = attempt, run_exec_ms, run_queue_ms, "↩️ Background run rolled back");
                    let deleted = scope.delete_run(run_id, thread_id).await;
                    match deleted {
                        Ok(()) => {}
                        Err(delete_err) if delete_err.is_failed_transaction() => {
                            tracing::warn!(%run_id, error = %delete_err, "Ignoring rollback error");
                            // Close the broken scope early so the thread can still be finalized
                            if let Err(rollback_err) = scope.rollback().await {
                                tracing::warn!(%run_id, error = %rollback_err, "Failed to close aborted scope");
                            }
                            scope = self.store.begin().await?;
                        }
                        Err(delete_err) => return Err(delete_err.into()),
                    }
                    checkpoint = None;
                    (RunStatus::Rollback, Some(err))
                }
                ErrorClass::Interrupt => {
                    tracing::info!(%run_id, run_attempt = attempt, run_exec_ms, run_queue_ms, "⏸️ Background run interrupted");
                    scope.set_status(run_id, RunStatus::Interrupted).await?;
                    (RunStatus::Interrupted, Some(err))
                }
                ErrorClass::Retriable => {
                    tracing::warn!(%run_id, run_attempt = attempt, run_exec_ms, run_queue_ms, error = %err, "🔁 Background run failed, will retry");
                    scope.set_status(run_id, RunStatus::Pending).await?;
                    scope.commit().await?;
                    return Err(err);
                }
                ErrorClass::Fatal => {
                    if err.is_remote() {
                        tracing::error!(%run_id, run_attempt = attempt, run_exec_ms, run_queue_ms, error = %err, "❌ Background run failed");
                    } else {
                        tracing::error!(%run_id, run_attempt = attempt, run_exec_ms, run_queue_ms, error = ?err, "❌ Background run failed");
                    }
                    scope.set_status(run_id, RunStatus::Error).await?;
                    (RunStatus::Error, Some(err))
                }
            },
        };

        if temporary {
            scope.delete_thread(thread_id).await?;
        } else {
            let thread_status = thread_status_for(checkpoint.as_ref(), error.as_ref());
            let thread_error = match thread_status {
                ThreadStatus::Error => error.as_ref().map(ToString::to_string),
                _ => None,
            };
            scope
                .set_thread_status(
                    thread_id,
                    thread_status,
                    checkpoint.as_ref().map(|checkpoint| &checkpoint.values),
                    thread_error.as_deref(),
                )
                .await?;
        }
        scope.commit().await?;

        Ok(WorkerResult {
            run,
            attempt,
            status,
            run_started_at,
            run_ended_at,
            checkpoint,
            error,
            webhook,
        })
    }

    /// Drain the pipeline stream under the run timeout
    async fn consume(&self, ctx: RunContext, sink: &mut CheckpointSink) -> Result<(), RunError> {
        let run_id = ctx.run.run_id;
        let pipeline = self
            .pipelines
            .resolve(&ctx.run.assistant_id)
            .ok_or_else(|| RunError::UnknownAssistant(ctx.run.assistant_id.clone()))?;
        let mut stream = pipeline.stream(ctx);

        let drain = async {
            let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; the claim already counts as a beat
            heartbeat.tick().await;

            let mut signal: Option<RunError> = None;
            loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            self.events.publish(run_id, event.name(), event.data());
                            match event {
                                PipelineEvent::Checkpoint(checkpoint) => sink.checkpoint(checkpoint),
                                PipelineEvent::TaskResult(result) => sink.task_result(&result),
                                PipelineEvent::Interrupt { reason } => {
                                    if signal.is_none() {
                                        signal = Some(RunError::UserInterrupt(reason));
                                    }
                                }
                                PipelineEvent::Rollback { reason } => {
                                    if signal.is_none() {
                                        signal = Some(RunError::UserRollback(reason));
                                    }
                                }
                                PipelineEvent::Progress(_) => {}
                            }
                        }
                        Some(Err(err)) => return Err(err),
                        None => break,
                    },
                    _ = heartbeat.tick() => {
                        if let Err(err) = self.store.heartbeat(run_id).await {
                            tracing::warn!(%run_id, error = %err, "💓 Failed to record heartbeat");
                        }
                    }
                }
            }

            match signal {
                Some(err) => Err(err),
                None => Ok(()),
            }
        };

        match tokio::time::timeout(self.run_timeout, drain).await {
            Ok(result) => result,
            Err(_) => Err(RunError::Timeout(self.run_timeout)),
        }
    }
}
