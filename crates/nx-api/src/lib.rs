//! NotifyX REST API
//!
//! Axum router over the singleton service graph: notification ingest and
//! inspection, queue/DLQ operator surface, template and rule CRUD, workflow
//! CRUD with runs/replay/cancel, connector registry and resolution preview,
//! SSE realtime run events, health, and the audit trail.

use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod audit;
pub mod auth;
pub mod connectors;
pub mod error;
pub mod health;
pub mod notifications;
pub mod rules;
pub mod runs;
pub mod state;
pub mod templates;
pub mod workflows;

pub use audit::{spawn_run_audit_bridge, AuditLog, AuditRecord};
pub use auth::{ApiKeyStore, AuthPrincipal};
pub use error::ApiError;
pub use state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/audit
async fn list_audit(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditRecord>>, ApiError> {
    if !principal.has_permission("audit:read") {
        return Err(ApiError::Forbidden("audit:read required".into()));
    }
    Ok(Json(
        state
            .audit
            .list(&principal.tenant_id, query.limit.unwrap_or(100)),
    ))
}

/// Build the full application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // health
        .route("/health", get(health::health))
        .route("/health/ready", get(health::ready))
        .route("/health/live", get(health::live))
        // notifications
        .route("/api/notifications", post(notifications::send))
        .route("/api/notifications/{id}", get(notifications::get))
        .route("/api/notifications/{id}/ack", post(notifications::ack))
        // queue & DLQ operator surface
        .route("/api/queue/stats", get(notifications::queue_stats))
        .route("/api/dlq", get(notifications::dlq_entries))
        .route("/api/dlq/{id}/requeue", post(notifications::dlq_requeue))
        // templates
        .route("/api/templates", put(templates::upsert).get(templates::list))
        .route(
            "/api/templates/{id}",
            get(templates::get).delete(templates::delete),
        )
        // rules
        .route("/api/rules", put(rules::upsert).get(rules::list))
        .route("/api/rules/{id}", get(rules::get).delete(rules::delete))
        // workflows
        .route(
            "/api/workflows",
            post(workflows::create).get(workflows::list),
        )
        .route("/api/workflows/import", post(workflows::import))
        .route(
            "/api/workflows/{id}",
            get(workflows::get)
                .put(workflows::update)
                .delete(workflows::delete),
        )
        .route("/api/workflows/{id}/validate", post(workflows::validate))
        .route("/api/workflows/{id}/export", get(workflows::export))
        .route(
            "/api/workflows/{id}/runs",
            post(workflows::trigger_run).get(workflows::list_runs),
        )
        .route("/api/workflows/{id}/events", get(runs::workflow_events))
        // runs
        .route("/api/runs/{id}", get(runs::get))
        .route("/api/runs/{id}/nodes", get(runs::nodes))
        .route("/api/runs/{id}/replay", post(runs::replay))
        .route("/api/runs/{id}/cancel", post(runs::cancel))
        .route("/api/runs/{id}/events", get(runs::run_events))
        // connectors
        .route("/api/connectors", get(connectors::list))
        .route("/api/connectors/import", post(connectors::import))
        .route("/api/connectors/resolve", post(connectors::resolve))
        // audit
        .route("/api/audit", get(list_audit))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
