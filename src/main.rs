use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use reliable_queue::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, Substrate};
use reliable_queue::config::Settings;
use reliable_queue::postgres::PostgresPool;
use reliable_queue::queue::create_queue_engine;
use reliable_queue::redis::{RedisHealth, RedisPool};
use reliable_queue::server::{create_app, AppState};
use reliable_queue::shutdown::GracefulShutdown;
use reliable_queue::tasks::OrphanMonitorTask;
use reliable_queue::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new().context("Failed to load configuration")?;
    let _telemetry = init_telemetry(&settings.logging, &settings.otel)?;
    tracing::info!(backend = settings.queue.backend.as_str(), "Configuration loaded");

    let breaker_config = CircuitBreakerConfig::from(&settings.redis);

    let redis_pool = if settings.queue.backend.needs_redis() {
        let pool = RedisPool::new(
            settings.redis.clone(),
            Arc::new(CircuitBreaker::with_config(Substrate::Redis, breaker_config.clone())),
            Arc::new(RedisHealth::new()),
        )?;
        if let Err(e) = pool.ping().await {
            tracing::warn!(error = %e, url = %pool.url(), "Redis not reachable at startup");
        }
        Some(Arc::new(pool))
    } else {
        None
    };

    let postgres_pool = if settings.queue.backend.needs_postgres() {
        let pool = PostgresPool::new(
            &settings.database,
            Arc::new(CircuitBreaker::with_config(Substrate::Postgres, breaker_config)),
        )
        .await
        .context("Failed to connect to PostgreSQL")?;
        if !pool.table_exists(&settings.queue.table_name).await? {
            tracing::warn!(table = %settings.queue.table_name, "Queue table does not exist");
        }
        Some(Arc::new(pool))
    } else {
        None
    };

    let engine = Arc::new(create_queue_engine(
        &settings.queue,
        &settings.orphan,
        redis_pool.clone(),
        postgres_pool.clone(),
    )?);
    tracing::info!(
        queue = %engine.name(),
        backend = engine.backend_type(),
        "Queue engine ready"
    );

    let state = AppState::new(
        settings.clone(),
        engine.clone(),
        redis_pool,
        postgres_pool.clone(),
    )?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut shutdown = GracefulShutdown::new(engine.clone(), shutdown_tx.clone())
        .with_postgres_pool(postgres_pool);

    if settings.orphan.enabled && settings.queue.ephemeral_enabled {
        let monitor = OrphanMonitorTask::new(
            engine.clone(),
            settings.orphan.sweeper_config(),
            settings.orphan.action,
            shutdown_tx.subscribe(),
        );
        shutdown = shutdown.track_task(tokio::spawn(monitor.run()));
    }

    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.execute("signal").await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
