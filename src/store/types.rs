/// Run and thread type definitions
///
/// These are the records persisted by the run store and handed to the scheduler.
/// Timestamps are UTC; the keyword payload is kept as free-form JSON because the
/// pipeline owns its meaning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Status column of a run
///
/// `pending` and `running` are the only non-terminal values; a retried run goes
/// back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
    Interrupted,
    Rollback,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Interrupted => "interrupted",
            Self::Rollback => "rollback",
        }
    }

    /// Whether no further transition is expected from this status
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            "interrupted" => Ok(Self::Interrupted),
            "rollback" => Ok(Self::Rollback),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Visible status of a conversation thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Idle,
    Busy,
    Interrupted,
    Error,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Interrupted => "interrupted",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreadStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "interrupted" => Ok(Self::Interrupted),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown thread status: {other}")),
        }
    }
}

/// A unit of requested research work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Thread the run writes its results to
    pub thread_id: Uuid,
    /// Selects the pipeline that executes this run
    pub assistant_id: String,
    /// Current status column
    pub status: RunStatus,
    /// Keyword payload: input, config, webhook, temporary flag, auth context
    pub kwargs: Map<String, Value>,
    /// Caller supplied metadata, passed through untouched
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Remove the webhook target from the payload so the pipeline never sees it
    pub fn take_webhook(&mut self) -> Option<String> {
        match self.kwargs.remove("webhook") {
            Some(Value::String(url)) if !url.is_empty() => Some(url),
            _ => None,
        }
    }

    /// Temporary runs delete their thread instead of checkpointing it
    pub fn is_temporary(&self) -> bool {
        self.kwargs
            .get("temporary")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A run handed out by [`RunStore::claim_next`](super::RunStore::claim_next)
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub run: Run,
    /// 1 for the first claim, incremented on every re-claim
    pub attempt: u32,
}

/// Submission payload for a new pending run
#[derive(Debug, Clone)]
pub struct NewRun {
    pub thread_id: Uuid,
    pub assistant_id: String,
    pub kwargs: Map<String, Value>,
    pub metadata: Value,
}

/// Conversation thread the runs write into
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: Uuid,
    pub status: ThreadStatus,
    /// Values of the latest checkpoint recorded for the thread
    pub values: Option<Value>,
    /// Last error string, cleared on the next clean finish
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate queue counts for observability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub n_pending: u64,
    pub n_running: u64,
    /// Age of the oldest pending run
    pub max_age_secs: Option<f64>,
    /// Median age of pending runs
    pub med_age_secs: Option<f64>,
}

impl QueueStats {
    /// Build stats from pending run ages (seconds) and the running count
    pub fn from_pending_ages(mut ages: Vec<f64>, n_running: u64) -> Self {
        ages.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let med_age_secs = if ages.is_empty() {
            None
        } else if ages.len() % 2 == 1 {
            Some(ages[ages.len() / 2])
        } else {
            let upper = ages.len() / 2;
            Some((ages[upper - 1] + ages[upper]) / 2.0)
        };

        Self {
            n_pending: ages.len() as u64,
            n_running,
            max_age_secs: ages.last().copied(),
            med_age_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_with_kwargs(kwargs: Value) -> Run {
        let Value::Object(kwargs) = kwargs else {
            panic!("kwargs must be an object");
        };
        Run {
            run_id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            assistant_id: "research".to_string(),
            status: RunStatus::Pending,
            kwargs,
            metadata: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn take_webhook_removes_the_target_from_kwargs() {
        let mut run = run_with_kwargs(json!({"webhook": "http://x/hook", "input": {"topic": "rust"}}));

        assert_eq!(run.take_webhook().as_deref(), Some("http://x/hook"));
        assert!(!run.kwargs.contains_key("webhook"));
        assert_eq!(run.take_webhook(), None);
    }

    #[test]
    fn empty_or_non_string_webhooks_are_ignored() {
        let mut empty = run_with_kwargs(json!({"webhook": ""}));
        let mut numeric = run_with_kwargs(json!({"webhook": 42}));

        assert_eq!(empty.take_webhook(), None);
        assert_eq!(numeric.take_webhook(), None);
    }

    #[test]
    fn temporary_flag_defaults_to_false() {
        assert!(!run_with_kwargs(json!({})).is_temporary());
        assert!(run_with_kwargs(json!({"temporary": true})).is_temporary());
        assert!(!run_with_kwargs(json!({"temporary": "yes"})).is_temporary());
    }

    #[test]
    fn status_round_trips_through_its_column_value() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Error,
            RunStatus::Timeout,
            RunStatus::Interrupted,
            RunStatus::Rollback,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
        assert!("retry".parse::<RunStatus>().is_err());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(RunStatus::Rollback.is_terminal());
    }

    #[test]
    fn queue_stats_median_handles_even_counts() {
        let stats = QueueStats::from_pending_ages(vec![4.0, 1.0, 3.0, 2.0], 1);

        assert_eq!(stats.n_pending, 4);
        assert_eq!(stats.n_running, 1);
        assert_eq!(stats.max_age_secs, Some(4.0));
        assert_eq!(stats.med_age_secs, Some(2.5));
        assert_eq!(QueueStats::from_pending_ages(Vec::new(), 0).med_age_secs, None);
    }
}
