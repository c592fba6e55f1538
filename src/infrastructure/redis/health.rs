//! Connection state of the Redis queue substrate.
//!
//! [`RedisPool`](super::RedisPool) reports every dial, drop and fast-fail
//! here; `/health` serializes [`RedisHealth::stats`] as-is.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RedisHealthStatus {
    Connected = 0,
    /// No live connection; the next queue call dials
    Disconnected = 1,
    /// Breaker refused the last queue call
    CircuitOpen = 2,
}

impl RedisHealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedisHealthStatus::Connected => "connected",
            RedisHealthStatus::Disconnected => "disconnected",
            RedisHealthStatus::CircuitOpen => "circuit_open",
        }
    }

    fn from_raw(value: u8) -> Self {
        match value {
            0 => RedisHealthStatus::Connected,
            2 => RedisHealthStatus::CircuitOpen,
            _ => RedisHealthStatus::Disconnected,
        }
    }
}

pub struct RedisHealth {
    status: AtomicU8,
    /// Epoch ms of the last successful dial, 0 if never
    connected_at: AtomicI64,
    failed_dials: AtomicU32,
    reconnections: AtomicU64,
    dropped_connections: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl RedisHealth {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(RedisHealthStatus::Disconnected as u8),
            connected_at: AtomicI64::new(0),
            failed_dials: AtomicU32::new(0),
            reconnections: AtomicU64::new(0),
            dropped_connections: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn set_status(&self, status: RedisHealthStatus) -> RedisHealthStatus {
        RedisHealthStatus::from_raw(self.status.swap(status as u8, Ordering::AcqRel))
    }

    /// A dial succeeded. Counts as a reconnection unless it is the first.
    pub fn on_connected(&self) {
        let had_connected = self.connected_at.swap(super::current_time_ms(), Ordering::AcqRel) != 0;
        let previous = self.set_status(RedisHealthStatus::Connected);
        if had_connected && previous != RedisHealthStatus::Connected {
            self.reconnections.fetch_add(1, Ordering::Relaxed);
        }
        self.failed_dials.store(0, Ordering::Release);
    }

    pub fn on_dial_failed(&self, error: &impl ToString) {
        self.set_status(RedisHealthStatus::Disconnected);
        self.failed_dials.fetch_add(1, Ordering::AcqRel);
        *self.last_error.lock() = Some(error.to_string());
    }

    /// A queue command hit a connection-level error and the connection was discarded.
    pub fn on_connection_dropped(&self, error: &impl ToString) {
        self.set_status(RedisHealthStatus::Disconnected);
        self.dropped_connections.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    pub fn on_circuit_open(&self) {
        self.set_status(RedisHealthStatus::CircuitOpen);
    }

    pub fn status(&self) -> RedisHealthStatus {
        RedisHealthStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.status() == RedisHealthStatus::Connected
    }

    pub fn stats(&self) -> RedisHealthStats {
        let connected_at = self.connected_at.load(Ordering::Acquire);
        RedisHealthStats {
            status: self.status(),
            last_connected_ms: (connected_at != 0).then_some(connected_at),
            failed_dials: self.failed_dials.load(Ordering::Acquire),
            reconnections: self.reconnections.load(Ordering::Acquire),
            dropped_connections: self.dropped_connections.load(Ordering::Acquire),
            last_error: self.last_error.lock().clone(),
        }
    }
}

impl Default for RedisHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RedisHealthStats {
    pub status: RedisHealthStatus,
    pub last_connected_ms: Option<i64>,
    /// Dials failed since the last successful one
    pub failed_dials: u32,
    pub reconnections: u64,
    pub dropped_connections: u64,
    pub last_error: Option<String>,
}
