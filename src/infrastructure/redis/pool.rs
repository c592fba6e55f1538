//! Multiplexed Redis connection with circuit breaker accounting.

use std::future::Future;
use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};

use super::{RedisHealth, RedisHealthStats};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Connection not available: {0}")]
    ConnectionUnavailable(String),
}

/// Shared Redis connection for the queue backend.
///
/// A single multiplexed connection is dialed lazily and cloned per call.
/// Connection-level failures drop it so the next call redials; every
/// outcome feeds the circuit breaker.
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    circuit_breaker: Arc<CircuitBreaker>,
    health: Arc<RedisHealth>,
    config: RedisConfig,
}

impl RedisPool {
    pub fn new(
        config: RedisConfig,
        circuit_breaker: Arc<CircuitBreaker>,
        health: Arc<RedisHealth>,
    ) -> Result<Self, PoolError> {
        let client = Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            circuit_breaker,
            health,
            config,
        })
    }

    /// Current connection, dialing one if needed.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if !self.circuit_breaker.allow_request() {
            self.health.on_circuit_open();
            return Err(PoolError::CircuitOpen);
        }

        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection, PoolError> {
        let mut conn_guard = self.connection.write().await;

        // Another task may have connected while we waited
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                self.circuit_breaker.record_success();
                self.health.on_connected();
                tracing::info!("Redis pool connection established");
                Ok(conn)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                self.health.on_dial_failed(&e);
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Run `f` on a connection and record the outcome.
    ///
    /// Server-side script errors are not connection failures and do not
    /// count against the breaker.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
                    let mut conn_guard = self.connection.write().await;
                    *conn_guard = None;
                    self.health.on_connection_dropped(&e);
                    self.circuit_breaker.record_failure();
                    tracing::warn!(error = %e, "Redis connection dropped, next call redials");
                } else {
                    self.circuit_breaker.record_success();
                }
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Connected and breaker closed.
    pub fn is_healthy(&self) -> bool {
        self.health.is_connected() && self.circuit_breaker.state() == CircuitState::Closed
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn health_stats(&self) -> RedisHealthStats {
        self.health.stats()
    }

    pub fn breaker_stats(&self) -> CircuitBreakerStats {
        self.circuit_breaker.stats()
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub async fn ping(&self) -> Result<(), PoolError> {
        self.execute(|mut conn| async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}

/// Typed commands used by the Redis queue backend outside its scripts.
#[async_trait::async_trait]
pub trait RedisPoolExt {
    async fn llen(&self, key: &str) -> Result<usize, PoolError>;

    async fn zcard(&self, key: &str) -> Result<usize, PoolError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, PoolError>;

    /// Values for `fields` in order; missing fields are `None`.
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, PoolError>;

    /// All members of a sorted set, lowest score first.
    async fn zrange_all(&self, key: &str) -> Result<Vec<String>, PoolError>;

    async fn del(&self, keys: &[String]) -> Result<(), PoolError>;
}

#[async_trait::async_trait]
impl RedisPoolExt for RedisPool {
    async fn llen(&self, key: &str) -> Result<usize, PoolError> {
        self.execute(|mut conn| async move { conn.llen(key).await })
            .await
    }

    async fn zcard(&self, key: &str) -> Result<usize, PoolError> {
        self.execute(|mut conn| async move { conn.zcard(key).await })
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, PoolError> {
        self.execute(|mut conn| async move { conn.hget(key, field).await })
            .await
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, PoolError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        self.execute(|mut conn| async move {
            redis::cmd("HMGET")
                .arg(key)
                .arg(fields)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn zrange_all(&self, key: &str) -> Result<Vec<String>, PoolError> {
        self.execute(|mut conn| async move { conn.zrange(key, 0, -1).await })
            .await
    }

    async fn del(&self, keys: &[String]) -> Result<(), PoolError> {
        if keys.is_empty() {
            return Ok(());
        }

        self.execute(|mut conn| async move { conn.del::<_, ()>(keys).await })
            .await
    }
}
