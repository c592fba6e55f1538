//! Health check endpoint.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::circuit_breaker::{CircuitBreakerStats, CircuitState};
use crate::redis::RedisHealthStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub queue: QueueHealthResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisHealthResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresHealthResponse>,
}

#[derive(Debug, Serialize)]
pub struct QueueHealthResponse {
    pub name: String,
    pub backend: String,
    pub queue_size: Option<usize>,
    pub ephemeral_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RedisHealthResponse {
    pub connected: bool,
    pub connection: RedisHealthStats,
    pub circuit_breaker: CircuitBreakerStats,
}

#[derive(Debug, Serialize)]
pub struct PostgresHealthResponse {
    pub connected: bool,
    pub pool_size: u32,
    pub idle_connections: u32,
    pub circuit_breaker: CircuitBreakerStats,
}

/// GET /health
///
/// 200 when the queue backend answers, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let engine = &state.engine;
    let mut healthy = true;

    let queue = match engine.stats().await {
        Ok(stats) => QueueHealthResponse {
            name: stats.name,
            backend: stats.backend_type.to_string(),
            queue_size: stats.queue_size,
            ephemeral_size: stats.ephemeral_size,
            error: None,
        },
        Err(e) => {
            healthy = false;
            QueueHealthResponse {
                name: engine.name().to_string(),
                backend: engine.backend_type().to_string(),
                queue_size: None,
                ephemeral_size: None,
                error: Some(e.to_string()),
            }
        }
    };

    let redis = state.redis_pool.as_ref().map(|pool| {
        let circuit_breaker = pool.breaker_stats();
        healthy &= circuit_breaker.state != CircuitState::Open;
        RedisHealthResponse {
            connected: pool.is_healthy(),
            connection: pool.health_stats(),
            circuit_breaker,
        }
    });

    let postgres = match state.postgres_pool.as_ref() {
        Some(pool) => {
            let connected = pool.ping().await.is_ok();
            healthy &= connected;
            Some(PostgresHealthResponse {
                connected,
                pool_size: pool.pool().size(),
                idle_connections: pool.pool().num_idle() as u32,
                circuit_breaker: pool.breaker_stats(),
            })
        }
        None => None,
    };

    let (status, label) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            queue,
            redis,
            postgres,
        }),
    )
}
