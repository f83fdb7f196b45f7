//! Queue controller configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Queue controller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    /// Queue name, used as the table prefix by the storage
    pub name: String,

    /// Failures after which an item is dead-lettered
    pub max_attempts: u32,

    /// Items claimed per tick
    pub batch_size: usize,

    /// Pause between ticks
    #[serde(with = "crate::duration_millis")]
    pub throttle: Duration,

    /// Wait before the next tick when a tick claimed nothing
    #[serde(with = "crate::duration_millis")]
    pub poll_interval: Duration,

    /// Time between retry sweeps
    #[serde(with = "crate::duration_millis")]
    pub retry_interval: Duration,

    /// Items released per retry sweep
    pub retry_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_attempts: 5,
            batch_size: 2,
            throttle: Duration::ZERO,
            poll_interval: Duration::from_millis(100),
            retry_interval: Duration::from_secs(5),
            retry_batch_size: 10,
        }
    }
}

impl QueueConfig {
    /// Create a configuration for the named queue
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load from `QUEUE_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            name: std::env::var("QUEUE_NAME").unwrap_or(defaults.name),
            max_attempts: env_parse("QUEUE_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            batch_size: env_parse("QUEUE_BATCH_SIZE").unwrap_or(defaults.batch_size),
            throttle: env_parse("QUEUE_THROTTLE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.throttle),
            retry_interval: env_parse("QUEUE_RETRY_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_interval),
            ..defaults
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_retry_batch_size(mut self, batch_size: usize) -> Self {
        self.retry_batch_size = batch_size.max(1);
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
