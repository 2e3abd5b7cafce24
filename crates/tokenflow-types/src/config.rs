//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` in the data
//! directory. Every field has a default so a partial file is valid.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the engine.
///
/// Loaded from `~/.tokenflow/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the broadcast channel behind the event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    #[serde(default)]
    pub job_executor: JobExecutorConfig,
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_bus_capacity: default_event_bus_capacity(),
            job_executor: JobExecutorConfig::default(),
        }
    }
}

/// Settings for acquiring and running async-continuation and timer jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutorConfig {
    /// Upper bound on jobs running at the same time.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Jobs claimed per acquisition cycle.
    #[serde(default = "default_acquire_batch_size")]
    pub acquire_batch_size: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a claimed job stays locked to its owner.
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,

    /// Retries given to newly created jobs.
    #[serde(default = "default_retries")]
    pub default_retries: u32,

    /// Backoff after the first failure; doubled per further failure.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_acquire_batch_size() -> u32 {
    16
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lock_duration_secs() -> u64 {
    300
}

fn default_retries() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    10
}

fn default_max_backoff_secs() -> u64 {
    600
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            acquire_batch_size: default_acquire_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_duration_secs: default_lock_duration_secs(),
            default_retries: default_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}
