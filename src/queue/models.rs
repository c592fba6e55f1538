//! Queue configuration and statistics models

use std::time::Duration;

use serde::Serialize;

use super::backoff::BackoffConfig;
use super::error::QueueError;

/// Engine configuration for one logical queue.
///
/// Passed explicitly to the engine and its storage adapter; nothing here is
/// read from globals.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Logical queue name (metrics label, key prefix, scope value)
    pub name: String,
    /// Claim oldest-first when true; storage-native order otherwise
    pub fifo: bool,
    /// Track Taken messages; when false `take` removes outright
    pub ephemeral_enabled: bool,
    /// Capacity bound on Queued messages
    pub max_size: Option<usize>,
    /// Capacity bound on Taken messages
    pub ephemeral_max_size: Option<usize>,
    /// Number of retries after the first attempt on transient conflicts
    pub max_retries: u32,
    /// Delay between retries
    pub backoff: BackoffConfig,
    /// Default age after which a Taken message counts as orphaned
    pub orphan_threshold: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            fifo: true,
            ephemeral_enabled: true,
            max_size: None,
            ephemeral_max_size: None,
            max_retries: 3,
            backoff: BackoffConfig::default(),
            orphan_threshold: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl QueueConfig {
    /// Create a configuration with defaults for the named queue.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Reject configurations no backend can honor.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.trim().is_empty() {
            return Err(QueueError::InvalidConfig("queue name must not be empty".into()));
        }
        if self.max_size == Some(0) {
            return Err(QueueError::InvalidConfig("max_size must be positive".into()));
        }
        if self.ephemeral_max_size == Some(0) {
            return Err(QueueError::InvalidConfig(
                "ephemeral_max_size must be positive".into(),
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(QueueError::InvalidConfig(
                "backoff multiplier must be at least 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_factor) {
            return Err(QueueError::InvalidConfig(
                "backoff jitter_factor must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time statistics of a queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Backend type identifier
    pub backend_type: &'static str,
    /// Logical queue name
    pub name: String,
    /// Queued messages; `None` when the backend cannot count
    pub queue_size: Option<usize>,
    /// Taken messages; `None` when the backend cannot count
    pub ephemeral_size: Option<usize>,
    /// Configured capacity bound on Queued messages
    pub max_size: Option<usize>,
    /// Configured capacity bound on Taken messages
    pub ephemeral_max_size: Option<usize>,
    pub fifo: bool,
    pub ephemeral_enabled: bool,
    pub max_retries: u32,
}
