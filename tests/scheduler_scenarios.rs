//! End-to-end scheduler behaviour against the in-memory store.

use axum::{extract::State, routing::post, Json, Router};
use research_queue::pipeline::{
    Checkpoint, EventStream, Pipeline, PipelineEvent, PipelineRegistry, RunContext,
    ScriptedPipeline, Step,
};
use research_queue::runtime::{
    RunError, RunEventHub, RunScheduler, RunWorker, SchedulerConfig, WorkerGauge,
};
use research_queue::store::{MemoryRunStore, NewRun, RunStatus, RunStore, StoreError};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Fixture {
    store: MemoryRunStore,
    gauge: Arc<WorkerGauge>,
    shutdown: CancellationToken,
    scheduler: JoinHandle<()>,
}

impl Fixture {
    fn start(pipeline: Arc<dyn Pipeline>, concurrency: usize, run_timeout: Duration) -> Self {
        Self::start_polling(pipeline, concurrency, run_timeout, Duration::from_millis(25))
    }

    fn start_polling(
        pipeline: Arc<dyn Pipeline>,
        concurrency: usize,
        run_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let store = MemoryRunStore::new(poll_interval);
        let registry = Arc::new(PipelineRegistry::new());
        registry.register("research", pipeline);

        let worker = RunWorker::new(
            Arc::new(store.clone()),
            registry,
            Arc::new(RunEventHub::default()),
            run_timeout,
            Duration::from_secs(1),
        );
        let config = SchedulerConfig {
            concurrency,
            stats_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(5),
            error_backoff: Duration::from_millis(20),
        };
        let scheduler = RunScheduler::new(Arc::new(store.clone()), worker, config);
        let gauge = scheduler.gauge();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(shutdown.clone()));

        Self {
            store,
            gauge,
            shutdown,
            scheduler: handle,
        }
    }

    async fn submit(&self, kwargs: Value) -> Uuid {
        let Value::Object(kwargs) = kwargs else {
            panic!("kwargs must be an object");
        };
        self.store
            .create_run(NewRun {
                thread_id: Uuid::new_v4(),
                assistant_id: "research".to_string(),
                kwargs,
                metadata: json!({}),
            })
            .await
            .expect("create run")
            .run_id
    }

    async fn wait_for_status(&self, run_id: Uuid, status: RunStatus) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let current = self.store.get_run(run_id).await.expect("get run").map(|run| run.status);
            if current == Some(status) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "run {run_id} stuck at {current:?}, expected {status}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn stop(self) -> Duration {
        let started = Instant::now();
        self.shutdown.cancel();
        self.scheduler.await.expect("scheduler exits cleanly");
        started.elapsed()
    }
}

type Received = Arc<Mutex<Vec<Value>>>;

/// Local webhook target recording every body it receives
async fn webhook_receiver() -> (String, Received) {
    async fn record(State(received): State<Received>, Json(body): Json<Value>) -> &'static str {
        received.lock().expect("lock").push(body);
        "ok"
    }

    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/hook", post(record))
        .with_state(received.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind receiver");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("receiver runs");
    });

    (format!("http://{addr}/hook"), received)
}

async fn wait_for_webhooks(received: &Received, count: usize) -> Vec<Value> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let bodies = received.lock().expect("lock").clone();
        if bodies.len() >= count {
            return bodies;
        }
        assert!(Instant::now() < deadline, "expected {count} webhook calls, got {}", bodies.len());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn checkpoint(values: Value) -> Step {
    Step::Emit(PipelineEvent::Checkpoint(Checkpoint {
        values,
        ..Checkpoint::default()
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn successful_run_calls_the_webhook_with_final_values() {
    let (url, received) = webhook_receiver().await;
    let pipeline = Arc::new(ScriptedPipeline::new(|_| {
        vec![
            checkpoint(json!({"sections": ["intro"]})),
            checkpoint(json!({"sections": ["intro", "body"]})),
        ]
    }));
    let fixture = Fixture::start(pipeline, 2, Duration::from_secs(5));

    let run_id = fixture.submit(json!({"webhook": url})).await;
    fixture.wait_for_status(run_id, RunStatus::Success).await;

    let bodies = wait_for_webhooks(&received, 1).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["status"], "success");
    assert_eq!(bodies[0]["run_id"], json!(run_id));
    assert_eq!(bodies[0]["values"], json!({"sections": ["intro", "body"]}));
    assert!(bodies[0].get("error").is_none());

    fixture.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_runs_time_out_and_keep_their_checkpoint() {
    let pipeline = Arc::new(ScriptedPipeline::new(|ctx| {
        if ctx.run.kwargs.contains_key("slow") {
            vec![
                checkpoint(json!({"draft": 1})),
                Step::Sleep(Duration::from_secs(5)),
                checkpoint(json!({"draft": 2})),
            ]
        } else {
            vec![checkpoint(json!({"quick": true}))]
        }
    }));
    let fixture = Fixture::start(pipeline, 2, Duration::from_secs(1));

    // Unreachable webhook target: delivery fails, the scheduler must not care
    let run_id = fixture
        .submit(json!({"slow": true, "webhook": "http://127.0.0.1:9/hook"}))
        .await;
    fixture.wait_for_status(run_id, RunStatus::Timeout).await;

    let run = fixture.store.get_run(run_id).await.expect("get").expect("run");
    let thread = fixture
        .store
        .get_thread(run.thread_id)
        .await
        .expect("get")
        .expect("thread");
    assert_eq!(thread.values, Some(json!({"draft": 1})));

    let next = fixture.submit(json!({})).await;
    fixture.wait_for_status(next, RunStatus::Success).await;

    fixture.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_failures_are_retried_on_the_next_attempt() {
    let pipeline = Arc::new(ScriptedPipeline::new(|ctx| {
        if ctx.attempt == 1 {
            vec![Step::Fail(RunError::Store(StoreError::Transient(
                "connection reset".to_string(),
            )))]
        } else {
            vec![checkpoint(json!({"attempt": ctx.attempt}))]
        }
    }));
    let fixture = Fixture::start(pipeline, 1, Duration::from_secs(5));

    let run_id = fixture.submit(json!({})).await;
    fixture.wait_for_status(run_id, RunStatus::Success).await;

    let history = fixture.store.history(run_id);
    assert_eq!(history.claims, vec![1, 2]);
    assert_eq!(history.statuses, vec![RunStatus::Pending, RunStatus::Success]);
    // The second attempt is the same run
    assert_eq!(fixture.gauge.snapshot().runs_started, 1);

    fixture.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_runs_are_reported_while_the_queue_is_idle() {
    let (url, received) = webhook_receiver().await;
    let pipeline = Arc::new(ScriptedPipeline::new(|_| {
        vec![
            Step::Sleep(Duration::from_millis(300)),
            checkpoint(json!({"done": true})),
        ]
    }));
    // Idle claims block for the whole poll interval when nothing is submitted
    let fixture = Fixture::start_polling(pipeline, 2, Duration::from_secs(5), Duration::from_secs(30));

    let started = Instant::now();
    let run_id = fixture.submit(json!({"webhook": url})).await;
    fixture.wait_for_status(run_id, RunStatus::Success).await;

    let bodies = wait_for_webhooks(&received, 1).await;
    assert_eq!(bodies[0]["run_id"], json!(run_id));
    let deadline = Instant::now() + Duration::from_secs(5);
    while fixture.gauge.snapshot().active != 0 {
        assert!(Instant::now() < deadline, "slot never released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(started.elapsed() < Duration::from_secs(10), "took {:?}", started.elapsed());
    assert_eq!(fixture.gauge.snapshot().runs_started, 1);

    fixture.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runs_that_keep_failing_stop_at_the_attempt_ceiling() {
    let pipeline = Arc::new(ScriptedPipeline::new(|_| {
        vec![Step::Fail(RunError::Store(StoreError::Transient(
            "database is locked".to_string(),
        )))]
    }));
    let fixture = Fixture::start(pipeline.clone(), 1, Duration::from_secs(5));

    let run_id = fixture.submit(json!({})).await;
    fixture.wait_for_status(run_id, RunStatus::Error).await;

    let history = fixture.store.history(run_id);
    assert_eq!(history.claims, vec![1, 2, 3, 4]);
    assert_eq!(history.statuses.last(), Some(&RunStatus::Error));
    assert_eq!(pipeline.invocations(), 3);

    fixture.stop().await;
}

/// Pipeline that records how many streams are live at once
struct CountingPipeline {
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    work: Duration,
}

impl Pipeline for CountingPipeline {
    fn stream(&self, _ctx: RunContext) -> EventStream {
        let live = self.live.clone();
        let peak = self.peak.clone();
        let work = self.work;

        Box::pin(futures::stream::once(async move {
            let now = live.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(work).await;
            live.fetch_sub(1, Ordering::SeqCst);
            Ok(PipelineEvent::Progress(json!({"live": now})))
        }))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attempts_never_exceed_the_gate() {
    let peak = Arc::new(AtomicUsize::new(0));
    let pipeline = Arc::new(CountingPipeline {
        live: Arc::new(AtomicUsize::new(0)),
        peak: peak.clone(),
        work: Duration::from_millis(100),
    });
    let fixture = Fixture::start(pipeline, 2, Duration::from_secs(5));

    let mut run_ids = Vec::new();
    for _ in 0..6 {
        run_ids.push(fixture.submit(json!({})).await);
    }
    for run_id in &run_ids {
        fixture.wait_for_status(*run_id, RunStatus::Success).await;
    }

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak concurrency {peak} exceeded the gate");
    assert!(peak >= 1);

    fixture.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_abandons_long_runs_within_the_grace_period() {
    let pipeline = Arc::new(ScriptedPipeline::new(|_| {
        vec![Step::Sleep(Duration::from_secs(30))]
    }));
    let fixture = Fixture::start(pipeline.clone(), 5, Duration::from_secs(60));

    let mut run_ids = Vec::new();
    for _ in 0..5 {
        run_ids.push(fixture.submit(json!({})).await);
    }
    for run_id in &run_ids {
        fixture.wait_for_status(*run_id, RunStatus::Running).await;
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while pipeline.invocations() < 5 {
        assert!(Instant::now() < deadline, "attempts never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let store = fixture.store.clone();
    let elapsed = fixture.stop().await;

    assert!(elapsed < Duration::from_secs(6), "shutdown took {elapsed:?}");
    // Aborted attempts roll back; the runs wait for the sweep
    for run_id in run_ids {
        let run = store.get_run(run_id).await.expect("get").expect("run");
        assert_eq!(run.status, RunStatus::Running);
        assert!(store.history(run_id).statuses.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runs_for_unknown_assistants_fail_without_blocking_the_queue() {
    let pipeline = Arc::new(ScriptedPipeline::new(|_| vec![checkpoint(json!({"ok": true}))]));
    let fixture = Fixture::start(pipeline, 1, Duration::from_secs(5));

    let mut kwargs = Map::new();
    kwargs.insert("input".to_string(), json!("orphan"));
    let orphan = fixture
        .store
        .create_run(NewRun {
            thread_id: Uuid::new_v4(),
            assistant_id: "unregistered".to_string(),
            kwargs,
            metadata: json!({}),
        })
        .await
        .expect("create");
    let next = fixture.submit(json!({})).await;

    fixture.wait_for_status(orphan.run_id, RunStatus::Error).await;
    fixture.wait_for_status(next, RunStatus::Success).await;

    let thread = fixture
        .store
        .get_thread(orphan.thread_id)
        .await
        .expect("get")
        .expect("thread");
    assert!(thread
        .error
        .as_deref()
        .is_some_and(|error| error.contains("unregistered")));
    assert_eq!(fixture.store.history(orphan.run_id).claims, vec![1]);

    fixture.stop().await;
}
