/// Research pipeline contract
///
/// A pipeline turns one claimed run into an asynchronous sequence of events. The
/// execution unit drains that sequence to exhaustion and maps its outcome onto the
/// run state machine; it never looks inside the values a pipeline produces.

// Assistant id -> pipeline lookup with hot swapping
pub mod registry;

// Pipeline served by a sidecar graph server over server-sent events
pub mod remote;

// Event-stream line decoder used by the remote pipeline
pub mod sse;

// Fixed event scripts, used for demos and tests
pub mod scripted;

pub use registry::PipelineRegistry;
pub use remote::RemotePipeline;
pub use scripted::{ScriptedPipeline, Step};

use crate::runtime::{auth::AuthUser, RunError};
use crate::store::Run;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stream returned by [`Pipeline::stream`]
pub type EventStream = BoxStream<'static, Result<PipelineEvent, RunError>>;

/// Everything a pipeline gets to know about the attempt it serves
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Run record with the webhook target already removed
    pub run: Run,
    pub attempt: u32,
    /// Identity the attempt runs as, if any
    pub user: Option<AuthUser>,
}

/// A multi-stage research pipeline
pub trait Pipeline: Send + Sync {
    fn stream(&self, ctx: RunContext) -> EventStream;
}

/// One event emitted by a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Latest state snapshot; replaces the previous one
    Checkpoint(Checkpoint),
    /// Late result of one task, merged into the latest snapshot by id
    TaskResult(TaskResult),
    /// The pipeline paused waiting for external feedback
    Interrupt { reason: String },
    /// The caller asked for the run to be discarded
    Rollback { reason: String },
    /// Any other intermediate output
    Progress(Value),
}

impl PipelineEvent {
    /// Event name used on the run event hub
    pub fn name(&self) -> &'static str {
        match self {
            Self::Checkpoint(_) => "checkpoint",
            Self::TaskResult(_) => "task_result",
            Self::Interrupt { .. } => "interrupt",
            Self::Rollback { .. } => "rollback",
            Self::Progress(_) => "progress",
        }
    }

    /// Event payload without the name tag
    pub fn data(&self) -> Value {
        let result = match self {
            Self::Checkpoint(checkpoint) => serde_json::to_value(checkpoint),
            Self::TaskResult(result) => serde_json::to_value(result),
            Self::Interrupt { reason } | Self::Rollback { reason } => {
                Ok(serde_json::json!({ "reason": reason }))
            }
            Self::Progress(value) => Ok(value.clone()),
        };
        result.unwrap_or(Value::Null)
    }
}

/// State snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub values: Value,
    /// Nodes scheduled to run next; non-empty means the pipeline is paused
    #[serde(default)]
    pub next: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

/// Per-task entry of a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Task result update keyed by task id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Checkpoint {
    /// Merge a task result into the task with the same id.
    ///
    /// Returns false when no task matches; the result is then dropped.
    pub fn merge_task_result(&mut self, result: &TaskResult) -> bool {
        match self.tasks.iter_mut().find(|task| task.id == result.id) {
            Some(task) => {
                task.fields
                    .extend(result.fields.iter().map(|(key, value)| (key.clone(), value.clone())));
                true
            }
            None => false,
        }
    }

    /// Whether the pipeline stopped with work still scheduled
    pub fn is_paused(&self) -> bool {
        !self.next.is_empty()
    }
}
