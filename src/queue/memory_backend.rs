//! In-memory ring-buffer backend.
//!
//! Queued messages live in a `VecDeque` behind a mutex; Taken messages live in
//! a `DashMap` keyed by id. Data is lost on restart. Every operation completes
//! under its own lock, so this backend never reports a conflict.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use super::error::QueueError;
use super::message::{Message, MessageId};
use super::models::QueueConfig;
use super::storage::{QueueStorage, RequeueMode};

/// Queued messages plus an id index for duplicate detection.
struct Ring<I> {
    entries: VecDeque<Message<I>>,
    ids: HashSet<I>,
}

/// In-memory queue backend.
///
/// Lock order is always ring first, then the ephemeral map, so a message is
/// never observed in both or in neither while moving between them.
pub struct MemoryQueueBackend<I: MessageId = i64> {
    config: QueueConfig,
    ring: Mutex<Ring<I>>,
    ephemeral: DashMap<I, Message<I>>,
    sequence: AtomicI64,
}

impl<I: MessageId> MemoryQueueBackend<I> {
    /// Create a new memory queue backend with the given configuration.
    pub fn new(config: QueueConfig) -> Self {
        let capacity = config.max_size.unwrap_or(0).min(4096);
        Self {
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                ids: HashSet::with_capacity(capacity),
            }),
            ephemeral: DashMap::new(),
            sequence: AtomicI64::new(0),
            config,
        }
    }

    fn next_id(&self, ring: &Ring<I>) -> I {
        loop {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            let id = I::from_sequence(seq);
            if !ring.ids.contains(&id) && !self.ephemeral.contains_key(&id) {
                return id;
            }
        }
    }
}

#[async_trait]
impl<I: MessageId> QueueStorage<I> for MemoryQueueBackend<I> {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn insert(&self, msg: &Message<I>) -> Result<I, QueueError> {
        let mut ring = self.ring.lock();

        let id = match &msg.id {
            Some(id) => {
                if ring.ids.contains(id) || self.ephemeral.contains_key(id) {
                    return Err(QueueError::DuplicateKey(id.to_string()));
                }
                id.clone()
            }
            None => self.next_id(&ring),
        };

        if let Some(capacity) = self.config.max_size {
            if ring.entries.len() >= capacity {
                return Err(QueueError::QueueFull {
                    queue: self.config.name.clone(),
                    capacity,
                });
            }
        }

        let mut stored = msg.clone();
        stored.id = Some(id.clone());
        ring.ids.insert(id.clone());
        ring.entries.push_back(stored);

        tracing::trace!(
            queue = %self.config.name,
            message_id = %id,
            queue_size = ring.entries.len(),
            "Message inserted into ring"
        );

        Ok(id)
    }

    async fn claim_one(&self) -> Result<Option<Message<I>>, QueueError> {
        let mut ring = self.ring.lock();

        if ring.entries.is_empty() {
            return Ok(None);
        }

        if self.config.ephemeral_enabled {
            if let Some(capacity) = self.config.ephemeral_max_size {
                if self.ephemeral.len() >= capacity {
                    return Err(QueueError::EphemeralFull {
                        queue: self.config.name.clone(),
                        capacity,
                    });
                }
            }
        }

        let Some(msg) = ring.entries.pop_front() else {
            return Ok(None);
        };
        let Some(id) = msg.id.clone() else {
            return Err(QueueError::MissingId);
        };
        ring.ids.remove(&id);

        if self.config.ephemeral_enabled {
            self.ephemeral.insert(id, msg.clone());
        }

        Ok(Some(msg))
    }

    async fn delete(&self, id: &I) -> Result<bool, QueueError> {
        Ok(self.ephemeral.remove(id).is_some())
    }

    async fn release(
        &self,
        msg: &Message<I>,
        mode: RequeueMode,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let id = msg.id.as_ref().ok_or(QueueError::MissingId)?;
        let mut ring = self.ring.lock();

        let Some((id, stored)) = self.ephemeral.remove(id) else {
            return Ok(false);
        };

        let back = match mode {
            RequeueMode::Loud => stored.requeued_at(now),
            RequeueMode::Silent => stored,
        };

        // Requeue bypasses the capacity bound: the message already counted
        // against it when first queued.
        ring.ids.insert(id);
        ring.entries.push_back(back);
        Ok(true)
    }

    async fn scan_orphans(&self, cutoff: DateTime<Utc>) -> Result<Vec<Message<I>>, QueueError> {
        let mut orphans: Vec<Message<I>> = self
            .ephemeral
            .iter()
            .filter(|entry| entry.value().is_orphaned(cutoff))
            .map(|entry| entry.value().clone())
            .collect();

        orphans.sort_by_key(|msg| msg.queue_timestamp);
        Ok(orphans)
    }

    async fn queue_size(&self) -> Result<Option<usize>, QueueError> {
        Ok(Some(self.ring.lock().entries.len()))
    }

    async fn ephemeral_size(&self) -> Result<Option<usize>, QueueError> {
        Ok(Some(self.ephemeral.len()))
    }
}
