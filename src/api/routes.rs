use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::server::{api_key_auth, AppState};

use super::handlers::{list_orphans, queue_stats, recover_orphans};
use super::health::health;
use super::metrics::prometheus_metrics;

/// `/health` and `/metrics` are open; `/api/v1` requires the API key when
/// one is configured.
pub fn api_routes(state: AppState) -> Router<AppState> {
    let admin = Router::new()
        .route("/queue/stats", get(queue_stats))
        .route("/orphans", get(list_orphans))
        .route("/orphans/recover", post(recover_orphans))
        .route_layer(middleware::from_fn_with_state(state, api_key_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .nest("/api/v1", admin)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::Settings;
    use crate::queue::{MemoryQueueBackend, Message, QueueConfig, QueueEngine};
    use crate::server::{create_app, AppState, API_KEY_HEADER};

    fn state(api_key: Option<&str>) -> AppState {
        let mut settings = Settings::default();
        settings.api.key = api_key.map(str::to_string);

        let storage = Arc::new(MemoryQueueBackend::<i64>::new(QueueConfig::named("api")));
        let engine = Arc::new(QueueEngine::new(storage).unwrap());
        AppState::new(settings, engine, None, None).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_memory_backend() {
        let app = create_app(state(None));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["queue"]["backend"], "memory");
        assert_eq!(body["queue"]["queue_size"], 0);
    }

    #[tokio::test]
    async fn test_admin_routes_require_key() {
        let app = create_app(state(Some("secret")));

        let denied = app
            .clone()
            .oneshot(Request::get("/api/v1/queue/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(
                Request::get("/api/v1/queue/stats")
                    .header(API_KEY_HEADER, "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
        let body = body_json(allowed).await;
        assert_eq!(body["name"], "api");
    }

    #[tokio::test]
    async fn test_list_and_recover_orphans() {
        let state = state(None);
        state.engine.queue(&Message::new(b"a".to_vec())).await.unwrap();
        state.engine.take().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let app = create_app(state.clone());

        let listed = app
            .clone()
            .oneshot(
                Request::get("/api/v1/orphans?threshold_ms=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(listed.status(), StatusCode::OK);
        let body = body_json(listed).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["orphans"][0]["payload_bytes"], 1);

        let recovered = app
            .oneshot(
                Request::post("/api/v1/orphans/recover")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"action":"requeue","threshold_ms":0}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(recovered.status(), StatusCode::OK);
        let body = body_json(recovered).await;
        assert_eq!(body["outcome"]["requeued"], 1);
        assert_eq!(state.engine.queue_size().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_recover_rejects_report_action() {
        let app = create_app(state(None));
        let response = app
            .oneshot(
                Request::post("/api/v1/orphans/recover")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"action":"report"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_exposes_queue_collectors() {
        let state = state(None);
        state.engine.queue(&Message::new(b"m".to_vec())).await.unwrap();
        let app = create_app(state);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("rq_queue_operations_total"));
        assert!(text.contains("queue=\"api\""));
    }

    #[tokio::test]
    async fn test_out_of_range_threshold_is_bad_request() {
        let state = state(None);
        state.engine.queue(&Message::new(b"a".to_vec())).await.unwrap();
        state.engine.take().await.unwrap().unwrap();
        let app = create_app(state);

        let listed = app
            .clone()
            .oneshot(
                Request::get("/api/v1/orphans?threshold_ms=10000000000000000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(listed.status(), StatusCode::BAD_REQUEST);

        let recovered = app
            .oneshot(
                Request::post("/api/v1/orphans/recover")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"action":"requeue","threshold_ms":10000000000000000}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(recovered.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_serializes_redis_breaker() {
        use crate::circuit_breaker::{CircuitBreaker, Substrate};
        use crate::config::RedisConfig;
        use crate::redis::{RedisHealth, RedisPool};

        let breaker = Arc::new(CircuitBreaker::new(Substrate::Redis));
        for _ in 0..5 {
            breaker.record_failure();
        }
        let pool = RedisPool::new(RedisConfig::default(), breaker, Arc::new(RedisHealth::new()))
            .unwrap();

        let storage = Arc::new(MemoryQueueBackend::<i64>::new(QueueConfig::named("api")));
        let engine = Arc::new(QueueEngine::new(storage).unwrap());
        let state = AppState::new(Settings::default(), engine, Some(Arc::new(pool)), None).unwrap();

        let response = create_app(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["redis"]["connected"], false);
        assert_eq!(body["redis"]["connection"]["status"], "disconnected");
        assert_eq!(body["redis"]["circuit_breaker"]["substrate"], "redis");
        assert_eq!(body["redis"]["circuit_breaker"]["state"], "open");
        assert_eq!(body["redis"]["circuit_breaker"]["trips"], 1);
    }
}
