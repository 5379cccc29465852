//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::engine::transition::RetryPolicy;

/// Persistence backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; state is lost on restart.
    #[default]
    Memory,
    /// PostgreSQL store configured through `POSTGRES_*`.
    Postgres,
}

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `PIPELINE_`:
/// - `PIPELINE_HOST`: Server bind address (default: "0.0.0.0")
/// - `PIPELINE_PORT`: Server port (default: 8090)
/// - `PIPELINE_STORE`: `memory` or `postgres` (default: memory)
/// - `PIPELINE_NATS_URL`: NATS server for task dispatch and transition events
/// - `PIPELINE_WORKER_COUNT`: Concurrent work items in the driver (default: 16)
/// - `PIPELINE_LOG_JSON`: Emit JSON logs (default: false)
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Persistence backend
    #[serde(default)]
    pub store: StoreBackend,

    /// NATS URL (optional)
    #[serde(default)]
    pub nats_url: Option<String>,

    /// Maximum work items processed concurrently
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Interrupt consumer poll interval in milliseconds
    #[serde(default = "default_interrupt_poll_interval_ms")]
    pub interrupt_poll_interval_ms: u64,

    /// Expiry applied to dispatched tasks without a node timeout
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,

    /// Attempts for a single persisted transition before giving up
    #[serde(default = "default_persistence_max_attempts")]
    pub persistence_max_attempts: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_persistence_initial_backoff_ms")]
    pub persistence_initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_persistence_max_backoff_ms")]
    pub persistence_max_backoff_ms: u64,

    /// Delay before re-checking an execution denied by admission control
    #[serde(default = "default_admission_retry_secs")]
    pub admission_retry_secs: u64,

    /// Emit JSON formatted logs
    #[serde(default)]
    pub log_json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_server_name() -> String {
    "pipeline-engine".to_string()
}

fn default_worker_count() -> usize {
    16
}

fn default_interrupt_poll_interval_ms() -> u64 {
    500
}

fn default_task_timeout_secs() -> u64 {
    3600
}

fn default_persistence_max_attempts() -> u32 {
    5
}

fn default_persistence_initial_backoff_ms() -> u64 {
    50
}

fn default_persistence_max_backoff_ms() -> u64 {
    2000
}

fn default_admission_retry_secs() -> u64 {
    30
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `PIPELINE_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("PIPELINE_").from_env::<EngineConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Backoff policy for persisted transitions and task dispatch.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.persistence_max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.persistence_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.persistence_max_backoff_ms),
            multiplier: 2.0,
        }
    }

    pub fn interrupt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.interrupt_poll_interval_ms.max(1))
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }

    pub fn admission_retry(&self) -> Duration {
        Duration::from_secs(self.admission_retry_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_name: default_server_name(),
            store: StoreBackend::default(),
            nats_url: None,
            worker_count: default_worker_count(),
            interrupt_poll_interval_ms: default_interrupt_poll_interval_ms(),
            default_task_timeout_secs: default_task_timeout_secs(),
            persistence_max_attempts: default_persistence_max_attempts(),
            persistence_initial_backoff_ms: default_persistence_initial_backoff_ms(),
            persistence_max_backoff_ms: default_persistence_max_backoff_ms(),
            admission_retry_secs: default_admission_retry_secs(),
            log_json: false,
        }
    }
}
