//! Reliable at-least-once queue engine.
//!
//! A [`QueueEngine`] composes the primitive operations of a [`QueueStorage`]
//! adapter into the public queue contract: `queue`, `take`, `finish`,
//! `requeue`, `requeue_silent` and orphan discovery. A message moves through
//! three states:
//!
//! ```text
//! queue()          take()            finish()
//!   ──▶ Queued ─────────▶ Taken ──────────────▶ (gone)
//!          ▲                │
//!          └── requeue() ───┘
//! ```
//!
//! With ephemeral tracking disabled `take()` removes the message outright
//! and `finish()` is a no-op.
//!
//! # Backends
//!
//! | Backend | Type | Orphan scan | Notes |
//! |---------|------|-------------|-------|
//! | [`MemoryQueueBackend`] | `memory` | yes | Lost on restart |
//! | [`PostgresQueueBackend`] | `postgres` | yes | Queue + ephemeral tables, `SKIP LOCKED` |
//! | [`PostgresLessLockingBackend`] | `postgres_less_locking` | yes | Single table, claim tokens |
//! | [`RedisQueueBackend`] | `redis` | yes | Lua scripts over list, hash and sorted set |

mod backoff;
pub mod codec;
mod engine;
mod error;
pub mod factory;
pub mod less_locking_backend;
pub mod memory_backend;
mod message;
mod models;
mod orphan;
pub mod postgres_backend;
pub mod redis_backend;
mod retry;
mod sql;
mod storage;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use engine::QueueEngine;
pub use error::{ErrorKind, QueueError};
pub use factory::{create_queue_engine, create_queue_storage};
pub use less_locking_backend::PostgresLessLockingBackend;
pub use memory_backend::MemoryQueueBackend;
pub use message::{now, Message, MessageId};
pub use models::{QueueConfig, QueueStats};
pub use orphan::{
    OrphanAction, OrphanReport, OrphanScanner, OrphanSweeper, OrphanSweeperConfig,
    OrphanSweeperHandle, RecoveryOutcome,
};
pub use postgres_backend::PostgresQueueBackend;
pub use redis_backend::RedisQueueBackend;
pub use retry::RetryCoordinator;
pub use storage::{QueueStorage, RequeueMode};
