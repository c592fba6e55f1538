use std::sync::Arc;
use std::time::Instant;

use prometheus::Registry;

use crate::config::Settings;
use crate::postgres::PostgresPool;
use crate::queue::{OrphanScanner, QueueEngine, QueueError};
use crate::redis::RedisPool;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub engine: Arc<QueueEngine>,
    pub scanner: OrphanScanner,
    pub registry: Arc<Registry>,
    pub redis_pool: Option<Arc<RedisPool>>,
    pub postgres_pool: Option<Arc<PostgresPool>>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the state and register the engine's collectors.
    pub fn new(
        settings: Settings,
        engine: Arc<QueueEngine>,
        redis_pool: Option<Arc<RedisPool>>,
        postgres_pool: Option<Arc<PostgresPool>>,
    ) -> Result<Self, QueueError> {
        let registry = Registry::new();
        engine.metrics().register(&registry)?;

        Ok(Self {
            settings: Arc::new(settings),
            scanner: OrphanScanner::new(engine.clone()),
            engine,
            registry: Arc::new(registry),
            redis_pool,
            postgres_pool,
            start_time: Instant::now(),
        })
    }
}
