use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use crate::queue::{
    OrphanAction, OrphanReport, OrphanScanner, OrphanSweeperConfig, QueueEngine, RecoveryOutcome,
};

/// Consumes orphan sweep reports and applies the configured action.
///
/// Also refreshes the queue size gauges on every sweep interval.
pub struct OrphanMonitorTask {
    engine: Arc<QueueEngine>,
    sweeper: OrphanSweeperConfig,
    action: OrphanAction,
    shutdown: broadcast::Receiver<()>,
}

impl OrphanMonitorTask {
    pub fn new(
        engine: Arc<QueueEngine>,
        sweeper: OrphanSweeperConfig,
        action: OrphanAction,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            engine,
            sweeper,
            action,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let interval = self.sweeper.interval;
        let (handle, mut reports) = self.engine.spawn_orphan_sweeper(self.sweeper.clone());
        let scanner = OrphanScanner::new(self.engine.clone());

        let mut gauge_timer = tokio::time::interval(interval);
        gauge_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            queue = %self.engine.name(),
            action = %self.action,
            "Orphan monitor started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Orphan monitor received shutdown signal");
                    break;
                }
                report = reports.recv() => {
                    match report {
                        Some(report) => {
                            handle_report(&scanner, &report, self.action).await;
                        }
                        // Sweeper stopped on its own; keep refreshing gauges
                        None => {
                            wait_for_shutdown(&self.engine, &mut self.shutdown, interval).await;
                            break;
                        }
                    }
                }
                _ = gauge_timer.tick() => {
                    refresh_gauges(&self.engine).await;
                }
            }
        }

        handle.stop().await;
        drain(&mut reports);
        tracing::info!("Orphan monitor stopped");
    }
}

/// Log a report and apply `action` to it.
pub async fn handle_report(
    scanner: &OrphanScanner,
    report: &OrphanReport,
    action: OrphanAction,
) -> Option<RecoveryOutcome> {
    if report.is_empty() {
        tracing::debug!(queue = %report.queue, "No orphaned messages");
        return None;
    }

    let oldest = report
        .orphans
        .first()
        .map(|msg| msg.queue_timestamp.to_rfc3339())
        .unwrap_or_default();
    tracing::warn!(
        queue = %report.queue,
        orphans = report.len(),
        oldest = %oldest,
        threshold_ms = report.threshold.as_millis() as u64,
        "Orphaned messages found"
    );

    if action == OrphanAction::Report {
        return None;
    }

    let outcome = scanner.recover(report, action).await;
    tracing::info!(
        queue = %report.queue,
        action = %action,
        requeued = outcome.requeued,
        finished = outcome.finished,
        skipped = outcome.skipped,
        failed = outcome.failed,
        "Orphan recovery applied"
    );
    Some(outcome)
}

async fn refresh_gauges(engine: &QueueEngine) {
    if let Err(e) = engine.queue_size().await {
        tracing::debug!(error = %e, "Failed to sample queue size");
    }
    if let Err(e) = engine.ephemeral_size().await {
        tracing::debug!(error = %e, "Failed to sample ephemeral size");
    }
}

async fn wait_for_shutdown(
    engine: &QueueEngine,
    shutdown: &mut broadcast::Receiver<()>,
    interval: Duration,
) {
    let mut timer = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = timer.tick() => refresh_gauges(engine).await,
        }
    }
}

fn drain(reports: &mut mpsc::Receiver<OrphanReport>) {
    reports.close();
    while reports.try_recv().is_ok() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Message, MemoryQueueBackend, QueueConfig};

    fn engine() -> Arc<QueueEngine> {
        let storage = Arc::new(MemoryQueueBackend::<i64>::new(QueueConfig::named("monitor")));
        Arc::new(QueueEngine::new(storage).unwrap())
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = OrphanMonitorTask::new(
            engine(),
            OrphanSweeperConfig {
                interval: Duration::from_millis(20),
                ..OrphanSweeperConfig::default()
            },
            OrphanAction::Report,
            shutdown_rx,
        );

        let handle = tokio::spawn(task.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor should stop")
            .expect("monitor should not panic");
    }

    #[tokio::test]
    async fn test_requeue_action_recovers_orphans() {
        let engine = engine();
        engine.queue(&Message::new(b"stuck".to_vec())).await.unwrap();
        engine.take().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let scanner = OrphanScanner::new(engine.clone());
        let report = scanner.scan(Duration::ZERO).await.unwrap();
        assert_eq!(report.len(), 1);

        let outcome = handle_report(&scanner, &report, OrphanAction::Requeue)
            .await
            .unwrap();
        assert_eq!(outcome.requeued, 1);

        let msg = engine.take().await.unwrap().unwrap();
        assert_eq!(msg.num_requeues, 1);
    }

    #[tokio::test]
    async fn test_report_action_leaves_messages() {
        let engine = engine();
        engine.queue(&Message::new(b"stuck".to_vec())).await.unwrap();
        engine.take().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let scanner = OrphanScanner::new(engine.clone());
        let report = scanner.scan(Duration::ZERO).await.unwrap();
        assert!(handle_report(&scanner, &report, OrphanAction::Report)
            .await
            .is_none());
        assert_eq!(engine.ephemeral_size().await.unwrap(), Some(1));
    }
}
