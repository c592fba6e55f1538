//! Circuit breaker in front of a queue storage substrate.
//!
//! Each pool owns one breaker labelled with the [`Substrate`] it guards.
//! After `failure_threshold` consecutive storage failures the breaker trips
//! and queue calls against that substrate fail fast with a transient error
//! until `reset_timeout_ms` has passed. It then admits trial calls; enough
//! successes close it again, a single failure trips it anew.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

use crate::config::RedisConfig;

/// Storage a breaker guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Substrate {
    Postgres,
    Redis,
}

impl Substrate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Substrate::Postgres => "postgres",
            Substrate::Redis => "redis",
        }
    }
}

impl fmt::Display for Substrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Queue calls reach storage
    Closed = 0,
    /// Queue calls fail fast
    Open = 1,
    /// Trial calls reach storage
    HalfOpen = 2,
}

impl CircuitState {
    fn from_raw(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// Trial successes needed to close
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 30_000,
        }
    }
}

impl From<&RedisConfig> for CircuitBreakerConfig {
    fn from(config: &RedisConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_failure_threshold.max(1),
            success_threshold: config.circuit_breaker_success_threshold.max(1),
            reset_timeout_ms: config.circuit_breaker_reset_timeout_seconds.saturating_mul(1000),
        }
    }
}

fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct CircuitBreaker {
    substrate: Substrate,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    trial_successes: AtomicU32,
    /// When the breaker last tripped or went half-open (epoch ms)
    changed_at: AtomicI64,
    trips: AtomicU64,
    rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(substrate: Substrate) -> Self {
        Self::with_config(substrate, CircuitBreakerConfig::default())
    }

    pub fn with_config(substrate: Substrate, config: CircuitBreakerConfig) -> Self {
        Self {
            substrate,
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            trial_successes: AtomicU32::new(0),
            changed_at: AtomicI64::new(epoch_ms()),
            trips: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn substrate(&self) -> Substrate {
        self.substrate
    }

    fn raw_state(&self) -> CircuitState {
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Current state. An Open breaker whose timeout elapsed reports HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.try_half_open();
        self.raw_state()
    }

    /// Whether a storage call may proceed. Refusals are counted.
    pub fn allow_request(&self) -> bool {
        if self.state() == CircuitState::Open {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn record_success(&self) {
        match self.raw_state() {
            CircuitState::Closed => self.consecutive_failures.store(0, Ordering::Release),
            CircuitState::HalfOpen => {
                let successes = self.trial_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.close();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match self.raw_state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.trip(failures);
                }
            }
            CircuitState::HalfOpen => self.trip(1),
            // Failures while open push the next trial further out
            CircuitState::Open => self.changed_at.store(epoch_ms(), Ordering::Release),
        }
    }

    fn trip(&self, failures: u32) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        self.changed_at.store(epoch_ms(), Ordering::Release);
        self.trial_successes.store(0, Ordering::Release);
        let trips = self.trips.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::warn!(
            substrate = %self.substrate,
            failures,
            trips,
            reset_timeout_ms = self.config.reset_timeout_ms,
            "Storage circuit opened, queue calls will fail fast"
        );
    }

    fn close(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.changed_at.store(epoch_ms(), Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.trial_successes.store(0, Ordering::Release);
        tracing::info!(substrate = %self.substrate, "Storage circuit closed");
    }

    fn try_half_open(&self) {
        if self.raw_state() != CircuitState::Open {
            return;
        }
        let open_for = epoch_ms() - self.changed_at.load(Ordering::Acquire);
        if open_for < self.config.reset_timeout_ms as i64 {
            return;
        }

        let swapped = self.state.compare_exchange(
            CircuitState::Open as u8,
            CircuitState::HalfOpen as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            self.trial_successes.store(0, Ordering::Release);
            self.changed_at.store(epoch_ms(), Ordering::Release);
            tracing::info!(substrate = %self.substrate, "Storage circuit half-open, admitting trial calls");
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            substrate: self.substrate,
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            trips: self.trips.load(Ordering::Acquire),
            rejected_calls: self.rejected.load(Ordering::Acquire),
            last_change_ms: self.changed_at.load(Ordering::Acquire),
        }
    }
}

/// Breaker snapshot, serialized by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub substrate: Substrate,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Times the breaker has opened
    pub trips: u64,
    /// Calls refused while open
    pub rejected_calls: u64,
    pub last_change_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(failures: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::with_config(
            Substrate::Postgres,
            CircuitBreakerConfig {
                failure_threshold: failures,
                success_threshold: 2,
                reset_timeout_ms: reset_ms,
            },
        )
    }

    #[test]
    fn test_trips_after_consecutive_failures() {
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().trips, 1);
    }

    #[test]
    fn test_open_breaker_counts_rejected_calls() {
        let cb = breaker(1, 60_000);
        assert!(cb.allow_request());
        cb.record_failure();

        assert!(!cb.allow_request());
        assert!(!cb.allow_request());

        let stats = cb.stats();
        assert_eq!(stats.substrate, Substrate::Postgres);
        assert_eq!(stats.rejected_calls, 2);
        assert_eq!(stats.consecutive_failures, 1);
    }

    #[test]
    fn test_trial_successes_close() {
        let cb = breaker(1, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
    }

    #[test]
    fn test_trial_failure_trips_again() {
        let cb = breaker(1, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.raw_state(), CircuitState::Open);
        assert_eq!(cb.stats().trips, 2);
    }

    #[test]
    fn test_stats_serialize_with_substrate_label() {
        let cb = CircuitBreaker::new(Substrate::Redis);
        let json = serde_json::to_value(cb.stats()).unwrap();
        assert_eq!(json["substrate"], "redis");
        assert_eq!(json["state"], "closed");
        assert_eq!(json["rejected_calls"], 0);
    }

    #[test]
    fn test_config_from_redis_settings() {
        let redis = RedisConfig {
            circuit_breaker_reset_timeout_seconds: 7,
            circuit_breaker_failure_threshold: 0,
            ..RedisConfig::default()
        };
        let config = CircuitBreakerConfig::from(&redis);
        assert_eq!(config.reset_timeout_ms, 7_000);
        assert_eq!(config.failure_threshold, 1);
    }
}
