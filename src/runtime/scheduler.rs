/// Background run scheduler
///
/// A single control loop that:
/// - acquires a slot from the admission gate before every poll, bounding live attempts
/// - claims pending runs and spawns an execution unit for each
/// - handles completions: releases the slot, fires webhooks, logs unit failures
/// - logs worker and queue stats and sweeps stale runs on fixed intervals
///
/// The loop only ends on cancellation. Shutdown aborts every live attempt and
/// webhook, then waits a bounded grace period for them to unwind.

use crate::config::QueueConfig;
use crate::runtime::{
    error::RunError,
    webhook::{webhook_payload, WebhookDispatcher},
    worker::{RunWorker, WorkerResult},
};
use crate::store::RunStore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MIN_TICK: Duration = Duration::from_millis(10);

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum live attempts
    pub concurrency: usize,
    pub stats_interval: Duration,
    pub sweep_interval: Duration,
    /// Runs without a heartbeat for this long are handed back to the queue
    pub stale_after: Duration,
    pub shutdown_grace: Duration,
    /// Pause after a failed claim before polling again
    pub error_backoff: Duration,
}

impl From<&QueueConfig> for SchedulerConfig {
    fn from(queue: &QueueConfig) -> Self {
        Self {
            concurrency: queue.concurrency,
            stats_interval: queue.stats_interval(),
            sweep_interval: queue.sweep_interval(),
            stale_after: queue.stale_after(),
            shutdown_grace: queue.shutdown_grace(),
            error_backoff: queue.poll_interval(),
        }
    }
}

/// Snapshot of the admission gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub max: usize,
    pub active: usize,
    pub available: usize,
    pub runs_started: u64,
}

/// Admission gate plus counters, shared with the HTTP surface
#[derive(Debug)]
pub struct WorkerGauge {
    semaphore: Arc<Semaphore>,
    max: usize,
    runs_started: AtomicU64,
}

impl WorkerGauge {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            runs_started: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> WorkerStats {
        let available = self.semaphore.available_permits();
        WorkerStats {
            max: self.max,
            active: self.max.saturating_sub(available),
            available,
            runs_started: self.runs_started.load(Ordering::Relaxed),
        }
    }
}

/// What a spawned attempt hands back to the completion handler
struct Finished {
    run_id: Uuid,
    permit: OwnedSemaphorePermit,
    outcome: Result<WorkerResult, RunError>,
}

pub struct RunScheduler {
    store: Arc<dyn RunStore>,
    worker: RunWorker,
    webhooks: WebhookDispatcher,
    config: SchedulerConfig,
    gauge: Arc<WorkerGauge>,
}

impl RunScheduler {
    pub fn new(store: Arc<dyn RunStore>, worker: RunWorker, config: SchedulerConfig) -> Self {
        let gauge = Arc::new(WorkerGauge::new(config.concurrency));
        Self {
            store,
            worker,
            webhooks: WebhookDispatcher::new(),
            config,
            gauge,
        }
    }

    pub fn gauge(&self) -> Arc<WorkerGauge> {
        self.gauge.clone()
    }

    /// Run the scheduler loop until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            concurrency = self.gauge.max,
            run_timeout_secs = self.worker.run_timeout().as_secs(),
            "⏰ Starting background run scheduler"
        );

        let semaphore = self.gauge.semaphore.clone();
        let mut workers: JoinSet<Finished> = JoinSet::new();
        let mut webhooks: JoinSet<()> = JoinSet::new();

        let mut stats_tick = tokio::time::interval(self.config.stats_interval.max(MIN_TICK));
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_tick = tokio::time::interval(self.config.sweep_interval.max(MIN_TICK));
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut first_poll = true;
        let mut last_poll_empty = false;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    self.handle_completion(joined, &mut webhooks);
                }

                Some(joined) = webhooks.join_next(), if !webhooks.is_empty() => {
                    if let Err(err) = joined {
                        if !err.is_cancelled() {
                            tracing::error!(error = %err, "❌ Webhook task panicked");
                        }
                    }
                }

                _ = stats_tick.tick() => self.log_stats().await,

                _ = sweep_tick.tick() => self.sweep().await,

                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else {
                        tracing::error!("❌ Admission gate closed, stopping scheduler");
                        break;
                    };

                    let wait = last_poll_empty && !first_poll;
                    first_poll = false;

                    // Finished units still release their slot while a claim waits for work
                    let claim = self.store.claim_next(wait);
                    tokio::pin!(claim);
                    let claimed = loop {
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break None,
                            claimed = &mut claim => break Some(claimed),
                            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                                self.handle_completion(joined, &mut webhooks);
                            }
                        }
                    };
                    let Some(claimed) = claimed else {
                        break;
                    };

                    match claimed {
                        Ok(Some(claimed)) => {
                            last_poll_empty = false;
                            let run_id = claimed.run.run_id;
                            // Retries are not new runs
                            if claimed.attempt == 1 {
                                self.gauge.runs_started.fetch_add(1, Ordering::Relaxed);
                            }
                            let worker = self.worker.clone();
                            workers.spawn(async move {
                                let outcome = worker.execute(claimed).await;
                                Finished { run_id, permit, outcome }
                            });
                        }
                        Ok(None) => {
                            last_poll_empty = true;
                            drop(permit);
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "❌ Background worker scheduler failed");
                            last_poll_empty = true;
                            drop(permit);
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                _ = tokio::time::sleep(self.config.error_backoff) => {}
                            }
                        }
                    }
                }
            }
        }

        self.shutdown(workers, webhooks).await;
    }

    /// Runs once per finished attempt
    fn handle_completion(&self, joined: Result<Finished, JoinError>, webhooks: &mut JoinSet<()>) {
        let Finished {
            run_id,
            permit,
            outcome,
        } = match joined {
            Ok(finished) => finished,
            Err(err) => {
                // The permit was dropped with the task
                if !err.is_cancelled() {
                    tracing::error!(error = %err, "❌ Background worker panicked");
                }
                return;
            }
        };
        drop(permit);

        match outcome {
            Ok(result) => {
                if let Some(url) = result.webhook.clone() {
                    let payload = webhook_payload(&result);
                    let dispatcher = self.webhooks.clone();
                    webhooks.spawn(async move { dispatcher.dispatch(&url, &payload).await });
                }
            }
            Err(err) => {
                tracing::error!(%run_id, error = %err, "❌ Background worker failed");
            }
        }
    }

    async fn log_stats(&self) {
        let stats = self.gauge.snapshot();
        tracing::info!(
            max = stats.max,
            available = stats.available,
            active = stats.active,
            runs_started = stats.runs_started,
            "📊 Worker stats"
        );

        match self.store.stats().await {
            Ok(queue) => tracing::info!(
                n_pending = queue.n_pending,
                n_running = queue.n_running,
                max_age_secs = ?queue.max_age_secs,
                med_age_secs = ?queue.med_age_secs,
                "📊 Queue stats"
            ),
            Err(err) => tracing::warn!(error = %err, "⚠️ Failed to fetch queue stats"),
        }
    }

    async fn sweep(&self) {
        match self.store.sweep(self.config.stale_after).await {
            Ok(run_ids) if !run_ids.is_empty() => {
                tracing::info!(count = run_ids.len(), run_ids = ?run_ids, "🧹 Swept runs");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "⚠️ Failed to sweep runs"),
        }
    }

    async fn shutdown(&self, mut workers: JoinSet<Finished>, mut webhooks: JoinSet<()>) {
        tracing::info!(
            workers = workers.len(),
            webhooks = webhooks.len(),
            "🛑 Shutting down background run scheduler"
        );

        workers.abort_all();
        webhooks.abort_all();

        let drain = async {
            while workers.join_next().await.is_some() {}
            while webhooks.join_next().await.is_some() {}
        };

        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            tracing::warn!(
                grace_secs = self.config.shutdown_grace.as_secs_f64(),
                "⚠️ Shutdown grace period elapsed with tasks still unwinding"
            );
        } else {
            tracing::info!("✅ Background run scheduler stopped");
        }
    }
}
