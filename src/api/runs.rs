/// Run and thread REST API endpoints
///
/// Submits background runs, exposes run/thread records and queue statistics, and
/// streams live run events as server-sent events.

use crate::{
    pipeline::PipelineRegistry,
    runtime::{RunEvent, RunEventHub, WorkerGauge},
    store::{NewRun, RunStore},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Durable run store
    pub store: Arc<dyn RunStore>,
    /// Assistant -> pipeline lookup, used to reject unknown assistants up front
    pub registry: Arc<PipelineRegistry>,
    /// Live run events for streaming clients
    pub events: Arc<RunEventHub>,
    /// Scheduler admission gate counters
    pub gauge: Arc<WorkerGauge>,
    /// Assistant used when a request does not name one
    pub default_assistant: String,
}

/// Request body for run creation
#[derive(Debug, Default, Deserialize)]
pub struct CreateRunRequest {
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub input: Value,
    pub config: Option<Value>,
    pub metadata: Option<Value>,
    /// Called once the run reaches a terminal status
    pub webhook: Option<String>,
    /// Delete the thread once the run finishes
    #[serde(default)]
    pub temporary: bool,
}

impl CreateRunRequest {
    fn into_new_run(self, thread_id: Uuid, default_assistant: &str) -> NewRun {
        let mut kwargs = Map::new();
        kwargs.insert("input".to_string(), self.input);
        kwargs.insert("config".to_string(), self.config.unwrap_or_else(|| json!({})));
        if let Some(webhook) = self.webhook {
            kwargs.insert("webhook".to_string(), Value::String(webhook));
        }
        kwargs.insert("temporary".to_string(), Value::Bool(self.temporary));

        NewRun {
            thread_id,
            assistant_id: self
                .assistant_id
                .unwrap_or_else(|| default_assistant.to_string()),
            kwargs,
            metadata: self.metadata.unwrap_or_else(|| json!({})),
        }
    }
}

type SseStream = BoxStream<'static, Result<Event, axum::Error>>;

/// Create run and thread routes
pub fn create_run_routes() -> Router<AppState> {
    Router::new()
        .route("/threads/{thread_id}/runs", post(create_run))
        .route("/threads/{thread_id}", get(get_thread))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/stream", get(stream_run))
        .route("/queue/stats", get(queue_stats))
}

/// Submit a background run
///
/// POST /threads/{thread_id}/runs
/// Body: { "assistant_id": "...", "input": {...}, "config": {...}, "webhook": "...", "temporary": false }
async fn create_run(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Json(payload): Json<CreateRunRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let new_run = payload.into_new_run(thread_id, &state.default_assistant);

    if state.registry.resolve(&new_run.assistant_id).is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Assistant '{}' not found", new_run.assistant_id) })),
        ));
    }

    match state.store.create_run(new_run).await {
        Ok(run) => {
            tracing::info!(run_id = %run.run_id, thread_id = %run.thread_id, assistant_id = %run.assistant_id, "📥 Created background run");
            Ok(Json(json!(run)))
        }
        Err(e) => {
            tracing::error!("Failed to create run: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to create run" })),
            ))
        }
    }
}

/// GET /runs/{run_id}
async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Value>, StatusCode> {
    match state.store.get_run(run_id).await {
        Ok(Some(run)) => Ok(Json(json!(run))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get run {}: {}", run_id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /threads/{thread_id}
async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
) -> Result<Json<Value>, StatusCode> {
    match state.store.get_thread(thread_id).await {
        Ok(Some(thread)) => Ok(Json(json!(thread))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get thread {}: {}", thread_id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Stream live events of a run
///
/// GET /runs/{run_id}/stream
/// Runs that already finished get a single `end` event with their stored status.
async fn stream_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Sse<KeepAliveStream<SseStream>>, StatusCode> {
    // Subscribe before reading the status so no event slips between the two
    let rx = state.events.subscribe(run_id);

    let run = match state.store.get_run(run_id).await {
        Ok(Some(run)) => run,
        Ok(None) => {
            drop(rx);
            state.events.release_idle(run_id);
            return Err(StatusCode::NOT_FOUND);
        }
        Err(e) => {
            tracing::error!("Failed to get run {}: {}", run_id, e);
            drop(rx);
            state.events.release_idle(run_id);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let events: SseStream = if run.status.is_terminal() {
        drop(rx);
        state.events.release_idle(run_id);
        let end = RunEvent {
            event: "end".to_string(),
            data: json!({ "status": run.status }),
        };
        stream::once(async move { to_sse(end) }).boxed()
    } else {
        live_events(rx).map(to_sse).boxed()
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn live_events(rx: broadcast::Receiver<RunEvent>) -> BoxStream<'static, RunEvent> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Stream subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

fn to_sse(event: RunEvent) -> Result<Event, axum::Error> {
    Event::default().event(event.event).json_data(event.data)
}

/// Queue and worker statistics
///
/// GET /queue/stats
async fn queue_stats(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.store.stats().await {
        Ok(queue) => Ok(Json(json!({
            "queue": queue,
            "workers": state.gauge.snapshot(),
        }))),
        Err(e) => {
            tracing::error!("Failed to get queue stats: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_requests_become_kwargs() {
        let request: CreateRunRequest = serde_json::from_value(json!({
            "input": {"topic": "tokio internals"},
            "webhook": "http://x/hook",
            "temporary": true
        }))
        .expect("valid request");

        let new_run = request.into_new_run(Uuid::nil(), "research");

        assert_eq!(new_run.assistant_id, "research");
        assert_eq!(new_run.kwargs["input"], json!({"topic": "tokio internals"}));
        assert_eq!(new_run.kwargs["webhook"], "http://x/hook");
        assert_eq!(new_run.kwargs["temporary"], true);
        assert_eq!(new_run.kwargs["config"], json!({}));
        assert_eq!(new_run.metadata, json!({}));
    }

    #[test]
    fn requests_without_webhook_carry_none() {
        let new_run = CreateRunRequest::default().into_new_run(Uuid::nil(), "research");

        assert!(!new_run.kwargs.contains_key("webhook"));
        assert_eq!(new_run.kwargs["input"], Value::Null);
    }
}
