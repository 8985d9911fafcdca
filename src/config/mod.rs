/// Configuration management for the research queue
///
/// Handles server configuration, database location, background queue tuning and
/// pipeline wiring. Every value can be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Background run queue configuration
    pub queue: QueueConfig,
    /// Research pipeline wiring
    pub pipeline: PipelineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration for the durable run store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the run store database (default: "data")
    /// Creates: {data_dir}/runs.db
    pub data_dir: String,
}

/// Background queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of runs executing concurrently in this process
    pub concurrency: usize,
    /// Upper bound on pipeline consumption for a single attempt
    pub run_timeout_secs: u64,
    /// Heartbeat interval for running attempts; sweeps use twice this value
    pub heartbeat_secs: u64,
    /// How often worker and queue statistics are logged
    pub stats_interval_secs: u64,
    /// How long a waiting claim blocks before reporting an empty queue
    pub poll_interval_ms: u64,
    /// Bound on the shutdown drain of live attempts and webhooks
    pub shutdown_grace_secs: u64,
}

/// Research pipeline wiring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Assistant used when a run request does not name one
    pub default_assistant: String,
    /// Base URL of the sidecar graph server, if one is deployed
    pub remote_url: Option<String>,
    /// Identity for runs submitted without auth context
    pub backup_user_id: Option<String>,
}

impl QueueConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Runs silent for longer than this are handed back to the queue.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval() * 2
    }

    pub fn sweep_interval(&self) -> Duration {
        self.heartbeat_interval() * 2
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: env_or("N_JOBS_PER_WORKER", 10),
            run_timeout_secs: env_or("BG_JOB_TIMEOUT_SECS", 3600),
            heartbeat_secs: env_or("BG_JOB_HEARTBEAT", 120),
            stats_interval_secs: env_or("STATS_INTERVAL_SECS", 60),
            poll_interval_ms: env_or("RESEARCH_QUEUE_POLL_MS", 1000),
            shutdown_grace_secs: 5,
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("RESEARCH_QUEUE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("RESEARCH_QUEUE_PORT", 2024),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("RESEARCH_QUEUE_DATA_DIR")
                    .unwrap_or_else(|_| "data".to_string()),
            },
            queue: QueueConfig::default(),
            pipeline: PipelineConfig {
                default_assistant: std::env::var("RESEARCH_QUEUE_ASSISTANT")
                    .unwrap_or_else(|_| "research".to_string()),
                remote_url: std::env::var("RESEARCH_GRAPH_URL").ok().filter(|url| !url.is_empty()),
                backup_user_id: std::env::var("RESEARCH_QUEUE_BACKUP_USER")
                    .ok()
                    .filter(|user| !user.is_empty()),
            },
        }
    }
}

/// Read and parse an environment variable, falling back on absence or parse failure
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_cadence_is_twice_the_heartbeat() {
        let queue = QueueConfig {
            concurrency: 2,
            run_timeout_secs: 30,
            heartbeat_secs: 15,
            stats_interval_secs: 60,
            poll_interval_ms: 100,
            shutdown_grace_secs: 5,
        };

        assert_eq!(queue.stale_after(), Duration::from_secs(30));
        assert_eq!(queue.sweep_interval(), Duration::from_secs(30));
        assert_eq!(queue.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn unparsable_env_values_fall_back() {
        std::env::set_var("RESEARCH_QUEUE_TEST_BOGUS", "not-a-number");
        assert_eq!(env_or("RESEARCH_QUEUE_TEST_BOGUS", 7u64), 7);
        assert_eq!(env_or("RESEARCH_QUEUE_TEST_UNSET", 3usize), 3);
    }
}
