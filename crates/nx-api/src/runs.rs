//! Run Endpoints
//!
//! Run inspection, replay, cancellation, and the realtime push: long-lived
//! SSE streams of run events with a per-run increasing `seq`, scoped to the
//! authenticated tenant.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Json;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::broadcast;

use nx_workflow::{EventScope, NodeExecutionResult, RunMode, WorkflowRun};

use crate::auth::AuthPrincipal;
use crate::error::ApiError;
use crate::state::AppState;

/// GET /api/runs/{id}
pub async fn get(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Json<WorkflowRun>, ApiError> {
    state
        .engine
        .runs()
        .get(&principal.tenant_id, &id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("run '{}'", id)))
}

/// GET /api/runs/{id}/nodes
pub async fn nodes(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Json<Vec<NodeExecutionResult>>, ApiError> {
    let run = state
        .engine
        .runs()
        .get(&principal.tenant_id, &id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run '{}'", id)))?;
    Ok(Json(run.node_results))
}

#[derive(Debug, Deserialize, Default)]
pub struct ReplayRequest {
    #[serde(default)]
    pub input: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResponse {
    pub run_id: String,
    pub mode: RunMode,
}

/// POST /api/runs/{id}/replay
pub async fn replay(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
    body: Option<Json<ReplayRequest>>,
) -> Result<(StatusCode, Json<ReplayResponse>), ApiError> {
    let override_input = body.and_then(|Json(b)| b.input);
    let run = state
        .engine
        .replay(&principal.tenant_id, &id, override_input)
        .await?;
    state.audit.record(
        &principal.tenant_id,
        &principal.user_id,
        "run.replayed",
        &id,
        Some(serde_json::json!({ "newRunId": run.id })),
    );
    Ok((
        StatusCode::CREATED,
        Json(ReplayResponse {
            run_id: run.id,
            mode: run.mode,
        }),
    ))
}

/// POST /api/runs/{id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let run = state
        .engine
        .runs()
        .get(&principal.tenant_id, &id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run '{}'", id)))?;
    if run.status.is_terminal() {
        return Err(ApiError::Conflict(format!("run already {:?}", run.status)));
    }

    state.engine.cancel_run(&id);
    state.audit.record(
        &principal.tenant_id,
        &principal.user_id,
        "run.cancel_requested",
        &id,
        None,
    );
    Ok(StatusCode::ACCEPTED)
}

/// GET /api/runs/{id}/events: SSE stream of this run's events.
pub async fn run_events(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // the run need not exist yet (subscribe-before-trigger), but the scope
    // pins the tenant so cross-tenant subscription yields nothing
    let scope = EventScope::Run {
        tenant_id: principal.tenant_id.clone(),
        run_id: id,
    };
    Ok(event_stream(state, scope))
}

/// GET /api/workflows/{id}/events: SSE stream of all runs of a workflow.
pub async fn workflow_events(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let scope = EventScope::Workflow {
        tenant_id: principal.tenant_id.clone(),
        workflow_id: id,
    };
    Ok(event_stream(state, scope))
}

fn event_stream(
    state: AppState,
    scope: EventScope,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.bus.subscribe();
    let stream = futures::stream::unfold(
        (receiver, scope),
        |(mut receiver, scope)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if scope.matches(&event) => {
                        let sse = Event::default()
                            .id(event.seq.to_string())
                            .event("run-event")
                            .json_data(&event)
                            .unwrap_or_default();
                        return Some((Ok(sse), (receiver, scope)));
                    }
                    Ok(_) => continue,
                    // consumers deduplicate on seq; a lag shows as a gap
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );
    Sse::new(stream).keep_alive(KeepAlive::default())
}
