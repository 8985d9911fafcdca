//! Remote pipeline against a local sidecar graph server.

use axum::{
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use research_queue::pipeline::{Pipeline, PipelineEvent, RemotePipeline, RunContext};
use research_queue::runtime::{ErrorClass, RunError};
use research_queue::store::{Run, RunStatus};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use uuid::Uuid;

async fn checkpoint_then_end(Json(body): Json<Value>) -> impl IntoResponse {
    let stream = format!(
        "event: metadata\ndata: {{\"run_id\":{}}}\n\n\
         event: checkpoint\ndata: {{\"values\":{{\"attempt\":{}}},\"next\":[]}}\n\n\
         event: end\ndata:\n\n",
        body["run_id"], body["attempt"]
    );
    ([(CONTENT_TYPE, "text/event-stream")], stream)
}

async fn plain_text() -> &'static str {
    "not a stream"
}

async fn broken() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "graph server crashed")
}

async fn sidecar() -> String {
    let app = Router::new()
        .route("/ok/runs/stream", post(checkpoint_then_end))
        .route("/plain/runs/stream", post(plain_text))
        .route("/broken/runs/stream", post(broken));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind sidecar");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("sidecar runs");
    });
    format!("http://{addr}")
}

fn context(attempt: u32) -> RunContext {
    let now = Utc::now();
    RunContext {
        run: Run {
            run_id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            assistant_id: "research".to_string(),
            status: RunStatus::Running,
            kwargs: Map::new(),
            metadata: json!({}),
            created_at: now,
            updated_at: now,
        },
        attempt,
        user: None,
    }
}

async fn collect(pipeline: &RemotePipeline, ctx: RunContext) -> Vec<Result<PipelineEvent, RunError>> {
    pipeline.stream(ctx).collect().await
}

#[tokio::test]
async fn event_streams_are_translated_until_end() {
    let base = sidecar().await;
    let pipeline = RemotePipeline::new(format!("{base}/ok/"));
    let ctx = context(2);
    let run_id = ctx.run.run_id;

    let events = collect(&pipeline, ctx).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        Ok(PipelineEvent::Progress(value))
            if value["event"] == "metadata" && value["data"]["run_id"] == json!(run_id)
    ));
    let Some(Ok(PipelineEvent::Checkpoint(checkpoint))) = events.get(1) else {
        panic!("expected a checkpoint, got {:?}", events.get(1));
    };
    assert_eq!(checkpoint.values, json!({"attempt": 2}));
    assert!(!checkpoint.is_paused());
}

#[tokio::test]
async fn non_stream_responses_are_remote_errors() {
    let base = sidecar().await;
    let pipeline = RemotePipeline::new(format!("{base}/plain"));

    let events = collect(&pipeline, context(1)).await;

    assert_eq!(events.len(), 1);
    let Some(Err(err)) = events.first() else {
        panic!("expected an error, got {events:?}");
    };
    assert!(matches!(err, RunError::Remote(message) if message.contains("text/plain")));
    assert_eq!(err.class(), ErrorClass::Fatal);
}

#[tokio::test]
async fn server_errors_surface_as_http_errors() {
    let base = sidecar().await;
    let pipeline = RemotePipeline::new(format!("{base}/broken"));

    let events = collect(&pipeline, context(1)).await;

    assert_eq!(events.len(), 1);
    let Some(Err(err)) = events.first() else {
        panic!("expected an error, got {events:?}");
    };
    let RunError::Http(http_err) = err else {
        panic!("expected an http error, got {err:?}");
    };
    assert_eq!(http_err.status().map(|status| status.as_u16()), Some(500));
    assert_eq!(err.class(), ErrorClass::Fatal);
}

#[tokio::test]
async fn unreachable_sidecars_are_retriable() {
    let pipeline = RemotePipeline::new("http://127.0.0.1:9");

    let events = collect(&pipeline, context(1)).await;

    assert_eq!(events.len(), 1);
    let Some(Err(err)) = events.first() else {
        panic!("expected an error, got {events:?}");
    };
    assert!(matches!(err, RunError::Http(_)));
    assert_eq!(err.class(), ErrorClass::Retriable);
}
