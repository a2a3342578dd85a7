//! Notification Endpoints
//!
//! Ingest, status/delivery history, acknowledgement, plus the operator
//! surface for the queue and dead-letter store.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;

use nx_common::NotificationEvent;
use nx_orchestrator::{NotificationRecord, SendOutcome};
use nx_queue::{DlqEntry, QueueStats};

use crate::auth::AuthPrincipal;
use crate::error::ApiError;
use crate::state::AppState;

/// POST /api/notifications
pub async fn send(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Json(mut event): Json<NotificationEvent>,
) -> Result<(StatusCode, Json<SendOutcome>), ApiError> {
    // the body's tenant is advisory; the principal wins
    event.tenant_id = principal.tenant_id.clone();
    if event.source.is_empty() {
        event.source = "api".into();
    }

    let outcome = state.orchestrator.send(event)?;
    state.audit.record(
        &principal.tenant_id,
        &principal.user_id,
        "notification.ingested",
        &outcome.notification_id,
        None,
    );
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// GET /api/notifications/{id}
pub async fn get(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Json<NotificationRecord>, ApiError> {
    state
        .orchestrator
        .store()
        .get(&principal.tenant_id, &id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("notification '{}'", id)))
}

#[derive(Debug, Deserialize, Default)]
pub struct AckRequest {
    #[serde(default)]
    pub by: Option<String>,
}

/// POST /api/notifications/{id}/ack: idempotent.
pub async fn ack(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
    body: Option<Json<AckRequest>>,
) -> Result<StatusCode, ApiError> {
    let by = body
        .and_then(|Json(b)| b.by)
        .unwrap_or_else(|| principal.user_id.clone());
    state.orchestrator.ack(&principal.tenant_id, &id, &by)?;
    state.audit.record(
        &principal.tenant_id,
        &principal.user_id,
        "notification.acknowledged",
        &id,
        None,
    );
    Ok(StatusCode::OK)
}

/// GET /api/queue/stats
pub async fn queue_stats(
    State(state): State<AppState>,
    _principal: AuthPrincipal,
) -> Json<QueueStats> {
    Json(state.queue.stats())
}

/// GET /api/dlq
pub async fn dlq_entries(
    State(state): State<AppState>,
    principal: AuthPrincipal,
) -> Json<Vec<DlqEntry>> {
    let entries = if principal.is_system_admin() {
        state.dlq.entries()
    } else {
        state.dlq.entries_for_tenant(&principal.tenant_id)
    };
    Json(entries)
}

/// POST /api/dlq/{id}/requeue: put a dead-lettered message back on the
/// queue with a fresh attempt budget.
pub async fn dlq_requeue(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let entry = state
        .dlq
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("dlq entry '{}'", id)))?;
    if !principal.can_access_tenant(&entry.message.tenant_id) {
        return Err(ApiError::Forbidden("entry belongs to another tenant".into()));
    }

    let entry = state
        .dlq
        .take(&id)
        .ok_or_else(|| ApiError::NotFound(format!("dlq entry '{}'", id)))?;
    let mut message = entry.message;
    message.attempt = 1;
    message.scheduled_for = None;
    if !state.queue.enqueue(message) {
        return Err(ApiError::Unavailable("queue at capacity".into()));
    }

    state.audit.record(
        &principal.tenant_id,
        &principal.user_id,
        "dlq.requeued",
        &id,
        None,
    );
    Ok(StatusCode::OK)
}
