//! Queue backend factory

use std::sync::Arc;

use crate::config::{OrphanSettings, QueueBackendKind, QueueSettings};
use crate::postgres::PostgresPool;
use crate::redis::pool::RedisPool;

use super::engine::QueueEngine;
use super::error::QueueError;
use super::less_locking_backend::PostgresLessLockingBackend;
use super::memory_backend::MemoryQueueBackend;
use super::models::QueueConfig;
use super::postgres_backend::PostgresQueueBackend;
use super::redis_backend::RedisQueueBackend;
use super::storage::QueueStorage;

/// Create the storage adapter selected by `settings.backend`.
///
/// A relational or Redis backend without its pool is a configuration error;
/// there is no silent fallback to memory, which would lose messages on
/// restart.
pub fn create_queue_storage(
    settings: &QueueSettings,
    config: QueueConfig,
    redis_pool: Option<Arc<RedisPool>>,
    postgres_pool: Option<Arc<PostgresPool>>,
) -> Result<Arc<dyn QueueStorage<i64>>, QueueError> {
    let missing_pool = |pool: &str| {
        QueueError::InvalidConfig(format!(
            "{} backend requested but no {} pool is configured",
            settings.backend.as_str(),
            pool
        ))
    };

    let storage: Arc<dyn QueueStorage<i64>> = match settings.backend {
        QueueBackendKind::Memory => {
            tracing::info!(backend = "memory", queue = %config.name, "Creating memory queue backend");
            Arc::new(MemoryQueueBackend::<i64>::new(config))
        }
        QueueBackendKind::Postgres => {
            let pool = postgres_pool.ok_or_else(|| missing_pool("postgres"))?;
            tracing::info!(
                backend = "postgres",
                queue = %config.name,
                table = %settings.table_name,
                ephemeral_table = %settings.ephemeral_table_name,
                "Creating PostgreSQL queue backend"
            );
            Arc::new(PostgresQueueBackend::new(
                config,
                pool.pool().clone(),
                settings.table_name.clone(),
                settings.ephemeral_table_name.clone(),
            )?)
        }
        QueueBackendKind::PostgresLessLocking => {
            let pool = postgres_pool.ok_or_else(|| missing_pool("postgres"))?;
            tracing::info!(
                backend = "postgres_less_locking",
                queue = %config.name,
                table = %settings.table_name,
                scope_by_name = settings.scope_by_name,
                "Creating less-locking PostgreSQL queue backend"
            );
            Arc::new(PostgresLessLockingBackend::new(
                config,
                pool.pool().clone(),
                settings.table_name.clone(),
                settings.scope_by_name,
            )?)
        }
        QueueBackendKind::Redis => {
            let pool = redis_pool.ok_or_else(|| missing_pool("redis"))?;
            tracing::info!(
                backend = "redis",
                queue = %config.name,
                prefix = %settings.redis_prefix,
                "Creating Redis queue backend"
            );
            Arc::new(RedisQueueBackend::new(config, pool, &settings.redis_prefix)?)
        }
    };

    Ok(storage)
}

/// Create an engine over the backend selected by `settings.backend`.
pub fn create_queue_engine(
    settings: &QueueSettings,
    orphan: &OrphanSettings,
    redis_pool: Option<Arc<RedisPool>>,
    postgres_pool: Option<Arc<PostgresPool>>,
) -> Result<QueueEngine<i64>, QueueError> {
    let config = settings.queue_config(orphan);
    config.validate()?;

    let storage = create_queue_storage(settings, config, redis_pool, postgres_pool)?;
    QueueEngine::new(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_engine() {
        let settings = QueueSettings {
            name: "factory".into(),
            ..QueueSettings::default()
        };

        let engine =
            create_queue_engine(&settings, &OrphanSettings::default(), None, None).unwrap();
        assert_eq!(engine.backend_type(), "memory");
        assert_eq!(engine.name(), "factory");
    }

    #[test]
    fn test_missing_pool_is_config_error() {
        for backend in [
            QueueBackendKind::Postgres,
            QueueBackendKind::PostgresLessLocking,
            QueueBackendKind::Redis,
        ] {
            let settings = QueueSettings {
                backend,
                ..QueueSettings::default()
            };
            let err = create_queue_engine(&settings, &OrphanSettings::default(), None, None)
                .err()
                .unwrap();
            assert!(matches!(err, QueueError::InvalidConfig(_)));
        }
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = QueueSettings {
            name: String::new(),
            ..QueueSettings::default()
        };
        let result = create_queue_engine(&settings, &OrphanSettings::default(), None, None);
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_redis_engine_without_connection() {
        use crate::circuit_breaker::{CircuitBreaker, Substrate};
        use crate::config::RedisConfig;
        use crate::redis::RedisHealth;

        let pool = RedisPool::new(
            RedisConfig::default(),
            Arc::new(CircuitBreaker::new(Substrate::Redis)),
            Arc::new(RedisHealth::new()),
        )
        .unwrap();
        let settings = QueueSettings {
            backend: QueueBackendKind::Redis,
            ..QueueSettings::default()
        };

        let engine = create_queue_engine(
            &settings,
            &OrphanSettings::default(),
            Some(Arc::new(pool)),
            None,
        )
        .unwrap();
        assert_eq!(engine.backend_type(), "redis");
    }
}
