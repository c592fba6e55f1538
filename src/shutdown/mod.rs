//! Graceful shutdown.
//!
//! The sequence is:
//! 1. Signal background tasks and wait for them to stop
//! 2. Wait a bounded time for in-flight (Taken) messages to be finished
//! 3. Record final queue sizes
//! 4. Close storage pools

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::postgres::PostgresPool;
use crate::queue::QueueEngine;

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for background tasks to stop (default: 5 seconds)
    pub task_timeout: Duration,
    /// Time allowed for Taken messages to be finished (default: 10 seconds)
    pub in_flight_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(5),
            in_flight_timeout: Duration::from_secs(10),
        }
    }
}

pub struct GracefulShutdown {
    engine: Arc<QueueEngine>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    postgres_pool: Option<Arc<PostgresPool>>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(engine: Arc<QueueEngine>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            engine,
            shutdown_tx,
            tasks: Vec::new(),
            postgres_pool: None,
            config: ShutdownConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ShutdownConfig) -> Self {
        self.config = config;
        self
    }

    /// Background task to wait for after the stop signal.
    pub fn track_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_postgres_pool(mut self, pool: Option<Arc<PostgresPool>>) -> Self {
        self.postgres_pool = pool;
        self
    }

    #[tracing::instrument(name = "graceful_shutdown", skip(self), fields(queue = %self.engine.name()))]
    pub async fn execute(mut self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Stopping background tasks");
        let _ = self.shutdown_tx.send(());
        result.tasks_stopped = self.stop_tasks().await;

        tracing::info!("Phase 2: Waiting for in-flight messages");
        result.in_flight_drained = self.wait_for_in_flight().await;

        tracing::info!("Phase 3: Recording final queue sizes");
        match self.engine.stats().await {
            Ok(stats) => {
                result.queue_size = stats.queue_size;
                result.ephemeral_size = stats.ephemeral_size;
                if self.engine.backend_type() == "memory" && stats.queue_size.unwrap_or(0) > 0 {
                    tracing::warn!(
                        queued = stats.queue_size.unwrap_or(0),
                        "Memory backend holds messages that will be lost on exit"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to read final queue sizes"),
        }

        tracing::info!("Phase 4: Closing storage pools");
        if let Some(pool) = &self.postgres_pool {
            pool.close().await;
        }

        result.duration = start.elapsed();
        result.success = result.tasks_stopped;

        tracing::info!(
            tasks_stopped = result.tasks_stopped,
            in_flight_drained = result.in_flight_drained,
            queue_size = ?result.queue_size,
            ephemeral_size = ?result.ephemeral_size,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    async fn stop_tasks(&mut self) -> bool {
        let mut all_stopped = true;
        let wait_all = join_all(self.tasks.iter_mut());

        if timeout(self.config.task_timeout, wait_all).await.is_err() {
            for task in &self.tasks {
                if !task.is_finished() {
                    task.abort();
                    all_stopped = false;
                }
            }
            tracing::warn!("Background tasks did not stop in time and were aborted");
        }

        all_stopped
    }

    /// Whether the ephemeral set emptied before the timeout.
    async fn wait_for_in_flight(&self) -> bool {
        if !self.engine.config().ephemeral_enabled {
            return true;
        }

        let engine = &self.engine;
        let wait = async {
            loop {
                match engine.ephemeral_size().await {
                    Ok(Some(0)) | Ok(None) => return,
                    Ok(Some(_)) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Cannot read ephemeral size during shutdown");
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };

        match timeout(self.config.in_flight_timeout, wait).await {
            Ok(()) => true,
            Err(_) => {
                let remaining = engine.ephemeral_size().await.ok().flatten().unwrap_or(0);
                tracing::warn!(
                    in_flight = remaining,
                    "In-flight messages remain Taken; they will surface as orphans"
                );
                false
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    pub tasks_stopped: bool,
    pub in_flight_drained: bool,
    pub queue_size: Option<usize>,
    pub ephemeral_size: Option<usize>,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Message, MemoryQueueBackend, QueueConfig};

    fn engine() -> Arc<QueueEngine> {
        let storage = Arc::new(MemoryQueueBackend::<i64>::new(QueueConfig::named("shutdown")));
        Arc::new(QueueEngine::new(storage).unwrap())
    }

    #[tokio::test]
    async fn test_shutdown_stops_listening_task() {
        let (tx, mut rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            let _ = rx.recv().await;
        });

        let result = GracefulShutdown::new(engine(), tx)
            .track_task(task)
            .execute("test shutdown")
            .await;

        assert!(result.success);
        assert!(result.tasks_stopped);
        assert!(result.in_flight_drained);
        assert_eq!(result.queue_size, Some(0));
    }

    #[tokio::test]
    async fn test_in_flight_timeout_reported() {
        let engine = engine();
        engine.queue(&Message::new(b"held".to_vec())).await.unwrap();
        engine.take().await.unwrap().unwrap();
        let (tx, _) = broadcast::channel(1);

        let result = GracefulShutdown::new(engine, tx)
            .with_config(ShutdownConfig {
                task_timeout: Duration::from_millis(50),
                in_flight_timeout: Duration::from_millis(150),
            })
            .execute("test shutdown")
            .await;

        assert!(!result.in_flight_drained);
        assert_eq!(result.ephemeral_size, Some(1));
    }

    #[tokio::test]
    async fn test_stubborn_task_is_aborted() {
        let (tx, _) = broadcast::channel(1);
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let result = GracefulShutdown::new(engine(), tx)
            .with_config(ShutdownConfig {
                task_timeout: Duration::from_millis(50),
                in_flight_timeout: Duration::from_millis(50),
            })
            .track_task(task)
            .execute("test shutdown")
            .await;

        assert!(!result.tasks_stopped);
        assert!(!result.success);
    }
}
