//! Orphan scanning and periodic sweeping.
//!
//! An orphan is a message that has stayed Taken longer than an operator
//! threshold. Scanning is read-only; recovery is an explicit caller decision
//! expressed as an [`OrphanAction`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::engine::QueueEngine;
use super::error::QueueError;
use super::message::{now, Message, MessageId};

/// What to do with orphaned messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanAction {
    /// Only report them
    #[default]
    Report,
    /// Put them back in the queue (counted requeue)
    Requeue,
    /// Drop them
    Finish,
}

impl OrphanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrphanAction::Report => "report",
            OrphanAction::Requeue => "requeue",
            OrphanAction::Finish => "finish",
        }
    }
}

impl fmt::Display for OrphanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrphanAction {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "report" => Ok(OrphanAction::Report),
            "requeue" => Ok(OrphanAction::Requeue),
            "finish" => Ok(OrphanAction::Finish),
            other => Err(QueueError::InvalidConfig(format!(
                "unknown orphan action: {}",
                other
            ))),
        }
    }
}

/// Result of one orphan scan.
#[derive(Debug, Clone)]
pub struct OrphanReport<I = i64> {
    pub queue: String,
    pub threshold: Duration,
    pub scanned_at: DateTime<Utc>,
    pub orphans: Vec<Message<I>>,
}

impl<I> OrphanReport<I> {
    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }
}

/// Counts from applying an [`OrphanAction`] to a report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryOutcome {
    pub requeued: usize,
    pub finished: usize,
    /// Messages no longer Taken when recovery reached them
    pub skipped: usize,
    pub failed: usize,
}

/// On-demand orphan scanning and recovery for one engine.
pub struct OrphanScanner<I: MessageId = i64> {
    engine: Arc<QueueEngine<I>>,
}

impl<I: MessageId> Clone for OrphanScanner<I> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<I: MessageId> OrphanScanner<I> {
    pub fn new(engine: Arc<QueueEngine<I>>) -> Self {
        Self { engine }
    }

    /// List Taken messages older than `threshold`.
    pub async fn scan(&self, threshold: Duration) -> Result<OrphanReport<I>, QueueError> {
        let scanned_at = now();
        let orphans = self.engine.get_orphan_messages(threshold).await?;

        Ok(OrphanReport {
            queue: self.engine.name().to_string(),
            threshold,
            scanned_at,
            orphans,
        })
    }

    /// Apply `action` to every message in `report`.
    ///
    /// Individual failures are logged and counted; the remaining messages are
    /// still processed.
    pub async fn recover(&self, report: &OrphanReport<I>, action: OrphanAction) -> RecoveryOutcome {
        let mut outcome = RecoveryOutcome::default();

        if action == OrphanAction::Report {
            return outcome;
        }

        for msg in &report.orphans {
            let result = match action {
                OrphanAction::Requeue => self.engine.requeue(msg).await.map(|done| {
                    if done {
                        outcome.requeued += 1;
                    }
                    done
                }),
                OrphanAction::Finish => self.engine.finish(msg).await.map(|_| {
                    outcome.finished += 1;
                    true
                }),
                OrphanAction::Report => Ok(true),
            };

            match result {
                Ok(true) => {}
                Ok(false) => outcome.skipped += 1,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(
                        queue = %report.queue,
                        message_id = %msg.id_label(),
                        action = %action,
                        error = %e,
                        "Failed to recover orphaned message"
                    );
                }
            }
        }

        tracing::info!(
            queue = %report.queue,
            action = %action,
            requeued = outcome.requeued,
            finished = outcome.finished,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "Orphan recovery completed"
        );

        outcome
    }
}

/// Periodic sweep settings.
#[derive(Debug, Clone)]
pub struct OrphanSweeperConfig {
    /// Time between scans
    pub interval: Duration,
    /// Age after which a Taken message is reported
    pub threshold: Duration,
    /// Capacity of the report channel
    pub channel_capacity: usize,
}

impl Default for OrphanSweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            threshold: Duration::from_secs(300),
            channel_capacity: 16,
        }
    }
}

/// Background task scanning for orphans at a fixed interval.
///
/// Reports go out over a bounded channel. When the consumer lags and the
/// channel is full the report is dropped; the next scan supersedes it.
pub struct OrphanSweeper<I: MessageId = i64> {
    scanner: OrphanScanner<I>,
    config: OrphanSweeperConfig,
    reports: mpsc::Sender<OrphanReport<I>>,
    stop: watch::Receiver<bool>,
}

/// Handle owning a running sweeper.
pub struct OrphanSweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl OrphanSweeperHandle {
    /// Signal the sweeper to stop and wait for it.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Orphan sweeper task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Shortest period between sweeps.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

impl<I: MessageId> OrphanSweeper<I> {
    /// Spawn a sweeper bound to `engine`. A zero interval is raised to
    /// [`MIN_SWEEP_INTERVAL`].
    pub fn spawn(
        engine: Arc<QueueEngine<I>>,
        mut config: OrphanSweeperConfig,
    ) -> (OrphanSweeperHandle, mpsc::Receiver<OrphanReport<I>>) {
        config.interval = config.interval.max(MIN_SWEEP_INTERVAL);
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let sweeper = Self {
            scanner: OrphanScanner::new(engine),
            config,
            reports: tx,
            stop: stop_rx,
        };
        let task = tokio::spawn(sweeper.run());

        (OrphanSweeperHandle { stop: stop_tx, task }, rx)
    }

    async fn run(mut self) {
        let mut timer = tokio::time::interval(self.config.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            queue = %self.scanner.engine.name(),
            interval_ms = self.config.interval.as_millis() as u64,
            threshold_ms = self.config.threshold.as_millis() as u64,
            "Orphan sweeper started"
        );

        loop {
            tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                }
                _ = timer.tick() => {
                    if !self.sweep().await {
                        break;
                    }
                }
            }
        }

        tracing::info!(queue = %self.scanner.engine.name(), "Orphan sweeper stopped");
    }

    /// One scan. Returns false when the sweeper should stop.
    async fn sweep(&self) -> bool {
        let report = match self.scanner.scan(self.config.threshold).await {
            Ok(report) => report,
            Err(QueueError::NotSupported { operation, backend }) => {
                tracing::warn!(
                    operation,
                    backend,
                    "Backend cannot scan for orphans, stopping sweeper"
                );
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Orphan scan failed, will retry next interval");
                return true;
            }
        };

        match self.reports.try_send(report) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(report)) => {
                tracing::warn!(
                    queue = %report.queue,
                    orphans = report.len(),
                    "Orphan report channel full, dropping report"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Orphan report receiver dropped, stopping sweeper");
                false
            }
        }
    }
}

impl<I: MessageId> QueueEngine<I> {
    /// Spawn a periodic orphan sweeper bound to this engine.
    pub fn spawn_orphan_sweeper(
        self: &Arc<Self>,
        config: OrphanSweeperConfig,
    ) -> (OrphanSweeperHandle, mpsc::Receiver<OrphanReport<I>>) {
        OrphanSweeper::spawn(self.clone(), config)
    }
}
