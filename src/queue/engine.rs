//! Queue engine: the take/finish/requeue state machine over a storage adapter.
//!
//! The engine owns no lock in front of storage. Exclusion is enforced by the
//! adapter (row locks, Lua scripts, the ring mutex) and transient conflicts are
//! absorbed by the [`RetryCoordinator`].
//!
//! # Example
//!
//! ```rust,ignore
//! let storage = Arc::new(MemoryQueueBackend::<i64>::new(QueueConfig::named("jobs")));
//! let engine = QueueEngine::new(storage)?;
//!
//! engine.queue(&Message::new("hello")).await?;
//! if let Some(msg) = engine.take().await? {
//!     // ... process ...
//!     engine.finish(&msg).await?;
//! }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::metrics::{outcome, QueueMetrics};

use super::error::QueueError;
use super::message::{now, Message, MessageId};
use super::models::{QueueConfig, QueueStats};
use super::retry::RetryCoordinator;
use super::storage::{QueueStorage, RequeueMode};

/// Reliable queue over one storage adapter.
pub struct QueueEngine<I: MessageId = i64> {
    storage: Arc<dyn QueueStorage<I>>,
    config: QueueConfig,
    retry: RetryCoordinator,
    metrics: Arc<QueueMetrics>,
}

impl<I: MessageId> QueueEngine<I> {
    /// Create an engine over `storage`, using the adapter's configuration.
    pub fn new(storage: Arc<dyn QueueStorage<I>>) -> Result<Self, QueueError> {
        let config = storage.config().clone();
        config.validate()?;

        let metrics = Arc::new(QueueMetrics::new(&config.name)?);
        let retry = RetryCoordinator::new(
            config.name.clone(),
            config.max_retries,
            config.backoff.clone(),
            metrics.clone(),
        );

        tracing::info!(
            queue = %config.name,
            backend = storage.backend_type(),
            fifo = config.fifo,
            ephemeral = config.ephemeral_enabled,
            max_retries = config.max_retries,
            "Queue engine created"
        );

        Ok(Self {
            storage,
            config,
            retry,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn backend_type(&self) -> &'static str {
        self.storage.backend_type()
    }

    /// Per-queue collectors; register them into a `prometheus::Registry`.
    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }

    /// Enqueue a message.
    ///
    /// The requeue counter is reset and both timestamps set to now. Inserting
    /// an id that is already present counts as success.
    #[tracing::instrument(skip(self, msg), fields(queue = %self.config.name, message_id = %msg.id_label()))]
    pub async fn queue(&self, msg: &Message<I>) -> Result<bool, QueueError> {
        let started = Instant::now();
        let fresh = msg.fresh_at(now());

        let storage = &self.storage;
        let fresh_ref = &fresh;
        let result = self
            .retry
            .attempt("queue", move |_| storage.insert(fresh_ref))
            .await;

        match result {
            Ok(id) => {
                tracing::trace!(assigned_id = %id, "Message queued");
                self.record("queue", outcome::OK, started);
                Ok(true)
            }
            Err(e) if e.is_duplicate() => {
                self.metrics.record_duplicate();
                self.record("queue", outcome::DUPLICATE, started);
                tracing::warn!(error = %e, "Message already present, treating queue as success");
                Ok(true)
            }
            Err(e) => {
                self.record("queue", outcome::ERROR, started);
                tracing::error!(error = %e, "Failed to queue message");
                Err(e)
            }
        }
    }

    /// Claim the next Queued message, if any. Never waits for one to arrive.
    #[tracing::instrument(skip(self), fields(queue = %self.config.name))]
    pub async fn take(&self) -> Result<Option<Message<I>>, QueueError> {
        let started = Instant::now();

        let storage = &self.storage;
        let result = self
            .retry
            .attempt("take", move |_| storage.claim_one())
            .await;

        match &result {
            Ok(Some(msg)) => {
                self.record("take", outcome::OK, started);
                tracing::debug!(
                    message_id = %msg.id_label(),
                    num_requeues = msg.num_requeues,
                    "Message taken"
                );
            }
            Ok(None) => self.record("take", outcome::EMPTY, started),
            Err(e) => {
                self.record("take", outcome::ERROR, started);
                tracing::error!(error = %e, "Failed to take message");
            }
        }

        result
    }

    /// Acknowledge a Taken message. Finishing an absent message is a no-op.
    #[tracing::instrument(skip(self, msg), fields(queue = %self.config.name, message_id = %msg.id_label()))]
    pub async fn finish(&self, msg: &Message<I>) -> Result<(), QueueError> {
        if !self.config.ephemeral_enabled {
            tracing::trace!("Ephemeral tracking disabled, nothing to finish");
            return Ok(());
        }

        let started = Instant::now();
        let id = msg.id.as_ref().ok_or(QueueError::MissingId)?;

        let storage = &self.storage;
        let result = self
            .retry
            .attempt("finish", move |_| storage.delete(id))
            .await;

        match result {
            Ok(true) => {
                self.record("finish", outcome::OK, started);
                tracing::debug!("Message finished");
                Ok(())
            }
            Ok(false) => {
                self.record("finish", outcome::MISS, started);
                tracing::debug!("Message already gone");
                Ok(())
            }
            Err(e) => {
                self.record("finish", outcome::ERROR, started);
                tracing::error!(error = %e, "Failed to finish message");
                Err(e)
            }
        }
    }

    /// Return a Taken message to the queue, incrementing its requeue counter.
    ///
    /// Only the first attempt is a counted requeue; retries after a transient
    /// conflict requeue silently so an interrupted attempt never double counts.
    /// Returns `false` when the message was not Taken.
    #[tracing::instrument(skip(self, msg), fields(queue = %self.config.name, message_id = %msg.id_label()))]
    pub async fn requeue(&self, msg: &Message<I>) -> Result<bool, QueueError> {
        let started = Instant::now();
        let ts = now();

        let result = if self.config.ephemeral_enabled {
            msg.id.as_ref().ok_or(QueueError::MissingId)?;
            let storage = &self.storage;
            self.retry
                .attempt("requeue", move |attempt| {
                    let mode = if attempt == 0 {
                        RequeueMode::Loud
                    } else {
                        RequeueMode::Silent
                    };
                    storage.release(msg, mode, ts)
                })
                .await
        } else {
            self.reinsert("requeue", msg.requeued_at(ts)).await
        };

        self.finish_requeue("requeue", result, started)
    }

    /// Return a Taken message to the queue without touching its counter or timestamps.
    #[tracing::instrument(skip(self, msg), fields(queue = %self.config.name, message_id = %msg.id_label()))]
    pub async fn requeue_silent(&self, msg: &Message<I>) -> Result<bool, QueueError> {
        let started = Instant::now();
        let ts = now();

        let result = if self.config.ephemeral_enabled {
            msg.id.as_ref().ok_or(QueueError::MissingId)?;
            let storage = &self.storage;
            self.retry
                .attempt("requeue_silent", move |_| {
                    storage.release(msg, RequeueMode::Silent, ts)
                })
                .await
        } else {
            self.reinsert("requeue_silent", msg.clone()).await
        };

        self.finish_requeue("requeue_silent", result, started)
    }

    /// Without ephemeral tracking a taken message no longer exists in storage,
    /// so requeueing inserts it again under its id.
    async fn reinsert(
        &self,
        operation: &'static str,
        msg: Message<I>,
    ) -> Result<bool, QueueError> {
        if msg.id.is_none() {
            return Err(QueueError::MissingId);
        }

        let storage = &self.storage;
        let msg_ref = &msg;
        match self
            .retry
            .attempt(operation, move |_| storage.insert(msg_ref))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_duplicate() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn finish_requeue(
        &self,
        operation: &'static str,
        result: Result<bool, QueueError>,
        started: Instant,
    ) -> Result<bool, QueueError> {
        match &result {
            Ok(true) => {
                self.record(operation, outcome::OK, started);
                tracing::debug!(operation, "Message requeued");
            }
            Ok(false) => {
                self.record(operation, outcome::MISS, started);
                tracing::debug!(operation, "Message was not taken, nothing to requeue");
            }
            Err(e) => {
                self.record(operation, outcome::ERROR, started);
                tracing::error!(operation, error = %e, "Failed to requeue message");
            }
        }
        result
    }

    /// Taken messages whose queue timestamp is older than `threshold`.
    ///
    /// Read-only; recovering them is the caller's decision.
    #[tracing::instrument(skip(self), fields(queue = %self.config.name))]
    pub async fn get_orphan_messages(
        &self,
        threshold: Duration,
    ) -> Result<Vec<Message<I>>, QueueError> {
        if !self.config.ephemeral_enabled {
            return Err(QueueError::NotSupported {
                operation: "get_orphan_messages",
                backend: self.storage.backend_type(),
            });
        }

        let started = Instant::now();
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| QueueError::InvalidConfig(format!("orphan threshold: {}", e)))?;
        let cutoff = now().checked_sub_signed(threshold).ok_or_else(|| {
            QueueError::InvalidConfig(format!("orphan threshold {:?} is out of range", threshold))
        })?;

        let storage = &self.storage;
        let result = self
            .retry
            .attempt("scan_orphans", move |_| storage.scan_orphans(cutoff))
            .await;

        match &result {
            Ok(orphans) => {
                self.metrics.set_orphans(orphans.len());
                self.record("scan_orphans", outcome::OK, started);
                if !orphans.is_empty() {
                    tracing::info!(count = orphans.len(), cutoff = %cutoff, "Orphaned messages found");
                }
            }
            Err(e) => {
                self.record("scan_orphans", outcome::ERROR, started);
                tracing::warn!(error = %e, "Orphan scan failed");
            }
        }

        result
    }

    /// Number of Queued messages; `None` when the backend cannot count.
    pub async fn queue_size(&self) -> Result<Option<usize>, QueueError> {
        let size = self.storage.queue_size().await?;
        if let Some(n) = size {
            self.metrics.set_queue_size(n);
        }
        Ok(size)
    }

    /// Number of Taken messages; `None` when the backend cannot count.
    pub async fn ephemeral_size(&self) -> Result<Option<usize>, QueueError> {
        if !self.config.ephemeral_enabled {
            return Ok(Some(0));
        }
        let size = self.storage.ephemeral_size().await?;
        if let Some(n) = size {
            self.metrics.set_ephemeral_size(n);
        }
        Ok(size)
    }

    /// Current statistics snapshot.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            backend_type: self.storage.backend_type(),
            name: self.config.name.clone(),
            queue_size: self.queue_size().await?,
            ephemeral_size: self.ephemeral_size().await?,
            max_size: self.config.max_size,
            ephemeral_max_size: self.config.ephemeral_max_size,
            fifo: self.config.fifo,
            ephemeral_enabled: self.config.ephemeral_enabled,
            max_retries: self.config.max_retries,
        })
    }

    fn record(&self, operation: &str, outcome: &str, started: Instant) {
        self.metrics
            .record_operation(operation, outcome, started.elapsed().as_secs_f64());
    }
}
