//! Exponential backoff between retry attempts

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 10,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Backoff that never sleeps. Useful for tests and in-process storage.
    pub fn none() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }
}

/// Exponential backoff calculator with jitter
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_delay_ms: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with default configuration
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    /// Create a new exponential backoff with custom configuration
    pub fn with_config(config: BackoffConfig) -> Self {
        let initial = config.initial_delay_ms as f64;
        Self {
            config,
            current_delay_ms: initial,
            attempt: 0,
        }
    }

    /// Get the next delay duration.
    ///
    /// The first call yields the initial delay; each later call multiplies the
    /// un-jittered base, capped at the maximum.
    pub fn next_delay(&mut self) -> Duration {
        if self.attempt > 0 {
            self.current_delay_ms = (self.current_delay_ms * self.config.multiplier)
                .min(self.config.max_delay_ms as f64);
        }
        self.attempt += 1;

        let base = self.current_delay_ms.min(self.config.max_delay_ms as f64);
        let jitter_range = base * self.config.jitter_factor;

        let final_delay = if jitter_range > 0.0 {
            let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
            (base + jitter).max(0.0)
        } else {
            base
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Reset the backoff to initial state
    pub fn reset(&mut self) {
        self.current_delay_ms = self.config.initial_delay_ms as f64;
        self.attempt = 0;
    }

    /// Get the current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}
