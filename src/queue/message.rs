//! Queue message model.
//!
//! A [`Message`] is pure data: identity, opaque payload, timestamps and the
//! requeue counter. State transitions are driven by the engine, never by the
//! message itself.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use chrono::{DateTime, SubsecRound, Utc};
use uuid::Uuid;

/// Identity type of a queue message.
///
/// Implemented for the identity schemes the backends use: `i64` sequences
/// (relational and Redis backends), `String` tokens and `Uuid`s.
pub trait MessageId: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static {
    /// Build an identity from a storage-assigned sequence number.
    ///
    /// Schemes that generate their own tokens may ignore `seq`.
    fn from_sequence(seq: i64) -> Self;

    /// Parse an identity from its textual (wire) form.
    fn parse(raw: &str) -> Result<Self, String>;
}

impl MessageId for i64 {
    fn from_sequence(seq: i64) -> Self {
        seq
    }

    fn parse(raw: &str) -> Result<Self, String> {
        raw.parse::<i64>().map_err(|e| e.to_string())
    }
}

impl MessageId for String {
    fn from_sequence(seq: i64) -> Self {
        seq.to_string()
    }

    fn parse(raw: &str) -> Result<Self, String> {
        Ok(raw.to_string())
    }
}

impl MessageId for Uuid {
    fn from_sequence(_seq: i64) -> Self {
        Uuid::new_v4()
    }

    fn parse(raw: &str) -> Result<Self, String> {
        Uuid::parse_str(raw).map_err(|e| e.to_string())
    }
}

/// Current time truncated to millisecond precision.
///
/// Every backend (and the wire form) stores milliseconds, so timestamps are
/// truncated at the source to keep round-trips exact.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A unit of work moving through the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<I = i64> {
    /// Unique identity within the queue; `None` until assigned by producer or storage
    pub id: Option<I>,

    /// Opaque payload
    pub payload: Vec<u8>,

    /// When the message was first queued
    pub original_timestamp: DateTime<Utc>,

    /// When the message last entered the Queued state
    pub queue_timestamp: DateTime<Utc>,

    /// Number of business-visible requeues
    pub num_requeues: u32,

    /// Advisory sharding hint
    pub partition_key: Option<String>,
}

impl<I: MessageId> Message<I> {
    /// Create a new message without identity; storage assigns one on insert.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        let ts = now();
        Self {
            id: None,
            payload: payload.into(),
            original_timestamp: ts,
            queue_timestamp: ts,
            num_requeues: 0,
            partition_key: None,
        }
    }

    /// Create a new message with a producer-assigned identity.
    pub fn with_id(id: I, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Some(id),
            ..Self::new(payload)
        }
    }

    /// Set the partition key.
    pub fn partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// The identity, if assigned.
    pub fn id(&self) -> Option<&I> {
        self.id.as_ref()
    }

    /// The payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as UTF-8 text, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Copy of this message as it enters the queue for the first time.
    pub(crate) fn fresh_at(&self, ts: DateTime<Utc>) -> Self {
        Self {
            original_timestamp: ts,
            queue_timestamp: ts,
            num_requeues: 0,
            ..self.clone()
        }
    }

    /// Copy of this message after a business-visible requeue at `ts`.
    pub(crate) fn requeued_at(&self, ts: DateTime<Utc>) -> Self {
        Self {
            queue_timestamp: ts.max(self.original_timestamp),
            num_requeues: self.num_requeues.saturating_add(1),
            ..self.clone()
        }
    }

    /// Whether the message has been Taken for longer than allowed.
    pub fn is_orphaned(&self, cutoff: DateTime<Utc>) -> bool {
        self.queue_timestamp < cutoff
    }
}

impl<I: Display> Message<I> {
    /// Identity rendered for logs; `-` when not yet assigned.
    pub fn id_label(&self) -> String {
        self.id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}
