//! Redis connectivity for the Redis queue backend.
//!
//! - `RedisHealth`: connection status for the health endpoint
//! - `pool`: multiplexed connection with breaker accounting

mod health;
pub mod pool;

pub use health::{RedisHealth, RedisHealthStats, RedisHealthStatus};
pub use pool::{PoolError, RedisPool, RedisPoolExt};

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
