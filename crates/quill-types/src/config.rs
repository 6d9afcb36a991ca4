//! Engine configuration types.
//!
//! `EngineConfig` mirrors the `config.toml` in the Quill data directory.
//! Every field has a default so a partial (or empty) file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the coordinator, step executor, and checkpoint writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default per-invocation step timeout, in seconds.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Default retry policy for retryable step failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// How many times a checkpoint save is attempted before the batch fails.
    #[serde(default = "default_checkpoint_write_attempts")]
    pub checkpoint_write_attempts: u32,

    #[serde(default = "default_checkpoint_retry_delay_ms")]
    pub checkpoint_retry_delay_ms: u64,

    /// Upper bound on batches executed by a single `advance` call.
    #[serde(default = "default_max_batches_per_advance")]
    pub max_batches_per_advance: u32,

    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// How long a driver's claim on an instance lasts without renewal.
    /// Drivers renew it between batches and while branches run.
    #[serde(default = "default_driver_lease_ms")]
    pub driver_lease_ms: u64,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_checkpoint_write_attempts() -> u32 {
    3
}

fn default_checkpoint_retry_delay_ms() -> u64 {
    100
}

fn default_max_batches_per_advance() -> u32 {
    100
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_driver_lease_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
            retry: RetryConfig::default(),
            checkpoint_write_attempts: default_checkpoint_write_attempts(),
            checkpoint_retry_delay_ms: default_checkpoint_retry_delay_ms(),
            max_batches_per_advance: default_max_batches_per_advance(),
            event_bus_capacity: default_event_bus_capacity(),
            driver_lease_ms: default_driver_lease_ms(),
        }
    }
}

impl EngineConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn checkpoint_retry_delay(&self) -> Duration {
        Duration::from_millis(self.checkpoint_retry_delay_ms)
    }

    pub fn driver_lease(&self) -> Duration {
        Duration::from_millis(self.driver_lease_ms)
    }
}

/// Retry settings for retryable step failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles for each further attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}
