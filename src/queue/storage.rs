//! Storage adapter contract.
//!
//! Each backend implements the primitive operations the engine composes:
//! insert-if-absent, atomic claim-one, delete-by-id, release-by-id, orphan scan
//! and counts. Adapters never retry; they surface transient conflicts as
//! [`QueueError::Conflict`] and let the engine's retry coordinator decide.
//!
//! # Thread Safety
//!
//! Implementations must be `Send + Sync`; one adapter is shared by every
//! producer and consumer task of a queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::QueueError;
use super::message::{Message, MessageId};
use super::models::QueueConfig;

/// How a Taken message returns to the Queued state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueMode {
    /// Business-visible requeue: counter + 1, queue timestamp refreshed
    Loud,
    /// State change only; counter and timestamps untouched
    Silent,
}

/// Primitive queue operations over one storage substrate.
#[async_trait]
pub trait QueueStorage<I: MessageId>: Send + Sync {
    /// Backend type identifier (for stats, logs and errors).
    fn backend_type(&self) -> &'static str;

    /// Configuration this adapter was built with.
    fn config(&self) -> &QueueConfig;

    /// Insert a message in the Queued state.
    ///
    /// Assigns an identity when the message carries none and returns the
    /// identity stored. Fails with `DuplicateKey` when the identity is already
    /// present (Queued or Taken) and `QueueFull` at the capacity bound.
    async fn insert(&self, msg: &Message<I>) -> Result<I, QueueError>;

    /// Atomically claim one Queued message.
    ///
    /// With ephemeral tracking enabled the message moves to Taken; otherwise
    /// it is removed outright. `Ok(None)` when nothing is Queued. A lost race
    /// against another claimant is a `Conflict`.
    async fn claim_one(&self) -> Result<Option<Message<I>>, QueueError>;

    /// Remove a Taken message. Returns whether a record was removed.
    async fn delete(&self, id: &I) -> Result<bool, QueueError>;

    /// Return a Taken message to the Queued state.
    ///
    /// Returns `false` when the message was not Taken.
    async fn release(
        &self,
        msg: &Message<I>,
        mode: RequeueMode,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError>;

    /// List Taken messages whose queue timestamp is older than `cutoff`.
    async fn scan_orphans(&self, _cutoff: DateTime<Utc>) -> Result<Vec<Message<I>>, QueueError> {
        Err(QueueError::NotSupported {
            operation: "scan_orphans",
            backend: self.backend_type(),
        })
    }

    /// Number of Queued messages; `None` when the backend cannot count.
    async fn queue_size(&self) -> Result<Option<usize>, QueueError> {
        Ok(None)
    }

    /// Number of Taken messages; `None` when the backend cannot count.
    async fn ephemeral_size(&self) -> Result<Option<usize>, QueueError> {
        Ok(None)
    }
}
