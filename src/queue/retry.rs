//! Bounded optimistic-retry loop.

use std::future::Future;
use std::sync::Arc;

use crate::metrics::QueueMetrics;

use super::backoff::{BackoffConfig, ExponentialBackoff};
use super::error::QueueError;

/// Re-runs storage operations that fail with a transient conflict.
///
/// The operation receives the number of retries performed so far, so callers
/// can switch strategy on retries (the engine requeues silently after the
/// first attempt). Non-transient errors pass through untouched.
#[derive(Clone)]
pub struct RetryCoordinator {
    queue: String,
    max_retries: u32,
    backoff: BackoffConfig,
    metrics: Arc<QueueMetrics>,
}

impl RetryCoordinator {
    pub fn new(
        queue: impl Into<String>,
        max_retries: u32,
        backoff: BackoffConfig,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        Self {
            queue: queue.into(),
            max_retries,
            backoff,
            metrics,
        }
    }

    /// Run `op` until it succeeds, fails non-transiently, or the retry bound is hit.
    pub async fn attempt<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut backoff = ExponentialBackoff::with_config(self.backoff.clone());
        let mut retries = 0u32;

        loop {
            match op(retries).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if retries >= self.max_retries {
                        self.metrics.record_retries_exhausted(operation);
                        tracing::error!(
                            queue = %self.queue,
                            operation,
                            attempts = retries + 1,
                            error = %e,
                            "Giving up after repeated storage conflicts"
                        );
                        return Err(QueueError::RetriesExhausted {
                            operation,
                            attempts: retries + 1,
                            source: Box::new(e),
                        });
                    }

                    let delay = backoff.next_delay();
                    self.metrics.record_retry(operation);
                    tracing::warn!(
                        queue = %self.queue,
                        operation,
                        attempt = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient storage conflict, retrying"
                    );

                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn coordinator(max_retries: u32) -> (RetryCoordinator, Arc<QueueMetrics>) {
        let metrics = Arc::new(QueueMetrics::new("retry-test").unwrap());
        let retry = RetryCoordinator::new("retry-test", max_retries, BackoffConfig::none(), metrics.clone());
        (retry, metrics)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let (retry, metrics) = coordinator(3);

        let value = retry.attempt("take", |_| async { Ok::<_, QueueError>(7) }).await.unwrap();

        assert_eq!(value, 7);
        assert_eq!(metrics.retry_count("take"), 0);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let (retry, metrics) = coordinator(3);
        let calls = AtomicU32::new(0);

        let seen = retry
            .attempt("take", |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(QueueError::Conflict("lock timeout".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(seen, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.retry_count("take"), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal() {
        let (retry, metrics) = coordinator(2);
        let calls = AtomicU32::new(0);

        let err = retry
            .attempt("requeue", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(QueueError::Conflict("deadlock".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            err,
            QueueError::RetriesExhausted { operation: "requeue", attempts: 3, .. }
        ));
        assert_eq!(metrics.retries_exhausted_count("requeue"), 1);
    }

    #[tokio::test]
    async fn test_non_transient_passes_through() {
        let (retry, metrics) = coordinator(5);
        let calls = AtomicU32::new(0);

        let err = retry
            .attempt("queue", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(QueueError::QueueFull {
                        queue: "q".into(),
                        capacity: 1,
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, QueueError::QueueFull { .. }));
        assert_eq!(metrics.retry_count("queue"), 0);
    }

    #[tokio::test]
    async fn test_zero_retries_fails_on_first_conflict() {
        let (retry, _) = coordinator(0);

        let err = retry
            .attempt("take", |_| async { Err::<(), _>(QueueError::Conflict("x".into())) })
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::RetriesExhausted { attempts: 1, .. }));
    }
}
