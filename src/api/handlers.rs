//! Queue inspection and orphan recovery endpoints.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::queue::{Message, OrphanAction, OrphanReport, QueueStats, RecoveryOutcome};
use crate::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct OrphanQuery {
    /// Age threshold; the configured default when absent
    pub threshold_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RecoverRequest {
    pub action: OrphanAction,
    #[serde(default)]
    pub threshold_ms: Option<u64>,
}

/// One Taken message as shown to operators. Payloads are not exposed.
#[derive(Debug, Serialize)]
pub struct OrphanView {
    pub id: Option<i64>,
    pub original_timestamp: DateTime<Utc>,
    pub queue_timestamp: DateTime<Utc>,
    pub num_requeues: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    pub payload_bytes: usize,
}

impl From<&Message<i64>> for OrphanView {
    fn from(msg: &Message<i64>) -> Self {
        Self {
            id: msg.id,
            original_timestamp: msg.original_timestamp,
            queue_timestamp: msg.queue_timestamp,
            num_requeues: msg.num_requeues,
            partition_key: msg.partition_key.clone(),
            payload_bytes: msg.payload.len(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrphansResponse {
    pub queue: String,
    pub threshold_ms: u64,
    pub scanned_at: DateTime<Utc>,
    pub count: usize,
    pub orphans: Vec<OrphanView>,
}

impl From<&OrphanReport> for OrphansResponse {
    fn from(report: &OrphanReport) -> Self {
        Self {
            queue: report.queue.clone(),
            threshold_ms: report.threshold.as_millis() as u64,
            scanned_at: report.scanned_at,
            count: report.len(),
            orphans: report.orphans.iter().map(OrphanView::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecoverResponse {
    pub queue: String,
    pub action: OrphanAction,
    pub found: usize,
    pub outcome: RecoveryOutcome,
}

fn threshold(state: &AppState, threshold_ms: Option<u64>) -> Duration {
    threshold_ms
        .map(Duration::from_millis)
        .unwrap_or(state.engine.config().orphan_threshold)
}

/// GET /api/v1/queue/stats
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>> {
    Ok(Json(state.engine.stats().await?))
}

/// GET /api/v1/orphans?threshold_ms=
pub async fn list_orphans(
    State(state): State<AppState>,
    Query(query): Query<OrphanQuery>,
) -> Result<Json<OrphansResponse>> {
    let report = state
        .scanner
        .scan(threshold(&state, query.threshold_ms))
        .await?;
    Ok(Json(OrphansResponse::from(&report)))
}

/// POST /api/v1/orphans/recover
pub async fn recover_orphans(
    State(state): State<AppState>,
    Json(request): Json<RecoverRequest>,
) -> Result<Json<RecoverResponse>> {
    if request.action == OrphanAction::Report {
        return Err(AppError::Validation(
            "action must be requeue or finish; use GET /api/v1/orphans to report".to_string(),
        ));
    }

    let report = state
        .scanner
        .scan(threshold(&state, request.threshold_ms))
        .await?;
    let outcome = state.scanner.recover(&report, request.action).await;

    tracing::info!(
        queue = %report.queue,
        action = %request.action,
        found = report.len(),
        requeued = outcome.requeued,
        finished = outcome.finished,
        failed = outcome.failed,
        "Orphan recovery requested via API"
    );

    Ok(Json(RecoverResponse {
        queue: report.queue.clone(),
        action: request.action,
        found: report.len(),
        outcome,
    }))
}
