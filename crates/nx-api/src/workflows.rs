//! Workflow Endpoints
//!
//! CRUD, run triggering/listing, and the import/export document:
//! `{ workflow, connectors: [{id, version}], lockfile: {id: version} }`.
//! Import validates the workflow, then resolves its connector set; export
//! is a pure snapshot.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use nx_registry::{Lockfile, ResolutionStrategy, Resolver};
use nx_workflow::{
    Diagnostic, RunFilter, RunMode, RunStatus, Workflow, WorkflowRun, WorkflowValidator,
};

use crate::auth::AuthPrincipal;
use crate::error::ApiError;
use crate::state::AppState;

fn validate_or_reject(state: &AppState, workflow: &Workflow) -> Result<(), ApiError> {
    let validator = WorkflowValidator::new(&state.connectors, &state.credentials);
    let diagnostics = validator.validate(workflow);
    if diagnostics.is_empty() {
        Ok(())
    } else {
        let messages: Vec<String> = diagnostics.iter().map(|d| d.message.clone()).collect();
        Err(ApiError::Validation(messages.join("; ")))
    }
}

/// POST /api/workflows
pub async fn create(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Json(mut workflow): Json<Workflow>,
) -> Result<(StatusCode, Json<Workflow>), ApiError> {
    workflow.tenant_id = principal.tenant_id.clone();
    if workflow.id.is_empty() {
        workflow.id = uuid::Uuid::new_v4().to_string();
    }
    workflow.created_at = Utc::now();
    workflow.updated_at = Utc::now();
    validate_or_reject(&state, &workflow)?;

    state.engine.workflows().insert(workflow.clone()).await?;
    state.audit.record(
        &principal.tenant_id,
        &principal.user_id,
        "workflow.created",
        &workflow.id,
        None,
    );
    Ok((StatusCode::CREATED, Json(workflow)))
}

/// GET /api/workflows/{id}
pub async fn get(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    state
        .engine
        .workflows()
        .get(&principal.tenant_id, &id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("workflow '{}'", id)))
}

/// GET /api/workflows
pub async fn list(
    State(state): State<AppState>,
    principal: AuthPrincipal,
) -> Result<Json<Vec<Workflow>>, ApiError> {
    Ok(Json(state.engine.workflows().list(&principal.tenant_id).await?))
}

/// PUT /api/workflows/{id}
pub async fn update(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
    Json(mut workflow): Json<Workflow>,
) -> Result<Json<Workflow>, ApiError> {
    workflow.tenant_id = principal.tenant_id.clone();
    workflow.id = id;
    workflow.updated_at = Utc::now();
    validate_or_reject(&state, &workflow)?;

    state.engine.workflows().update(workflow.clone()).await?;
    state.audit.record(
        &principal.tenant_id,
        &principal.user_id,
        "workflow.updated",
        &workflow.id,
        None,
    );
    Ok(Json(workflow))
}

/// DELETE /api/workflows/{id}
pub async fn delete(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.engine.workflows().delete(&principal.tenant_id, &id).await? {
        state.audit.record(
            &principal.tenant_id,
            &principal.user_id,
            "workflow.deleted",
            &id,
            None,
        );
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("workflow '{}'", id)))
    }
}

/// POST /api/workflows/{id}/validate: diagnostics without saving.
pub async fn validate(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Json<Vec<Diagnostic>>, ApiError> {
    let workflow = state
        .engine
        .workflows()
        .get(&principal.tenant_id, &id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("workflow '{}'", id)))?;
    let validator = WorkflowValidator::new(&state.connectors, &state.credentials);
    Ok(Json(validator.validate(&workflow)))
}

#[derive(Debug, Deserialize, Default)]
pub struct TriggerRunRequest {
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRunResponse {
    pub run_id: String,
}

/// POST /api/workflows/{id}/runs
pub async fn trigger_run(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
    body: Option<Json<TriggerRunRequest>>,
) -> Result<(StatusCode, Json<TriggerRunResponse>), ApiError> {
    let input = body.map(|Json(b)| b.input).unwrap_or(serde_json::Value::Null);
    let run = state
        .engine
        .start_run(&principal.tenant_id, &id, input, &principal.user_id, RunMode::Manual)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(TriggerRunResponse { run_id: run.id }),
    ))
}

#[derive(Debug, Deserialize, Default)]
pub struct RunListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub page: Option<usize>,
}

/// GET /api/workflows/{id}/runs?status=&from=&to=&page=
pub async fn list_runs(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
    Query(query): Query<RunListQuery>,
) -> Result<Json<Vec<WorkflowRun>>, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some("Pending") => Some(RunStatus::Pending),
        Some("Running") => Some(RunStatus::Running),
        Some("Completed") => Some(RunStatus::Completed),
        Some("Failed") => Some(RunStatus::Failed),
        Some("Cancelled") => Some(RunStatus::Cancelled),
        Some("Timeout") => Some(RunStatus::Timeout),
        Some(other) => {
            return Err(ApiError::Validation(format!("unknown status '{}'", other)))
        }
    };
    let filter = RunFilter {
        status,
        from: query.from,
        to: query.to,
        page: query.page.unwrap_or(0),
        page_size: 50,
    };
    let runs = state
        .engine
        .runs()
        .list_for_workflow(&principal.tenant_id, &id, &filter)
        .await?;
    Ok(Json(runs))
}

// ============================================================================
// Import / Export
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorRef {
    pub id: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExportDocument {
    pub workflow: Workflow,
    pub connectors: Vec<ConnectorRef>,
    #[serde(default)]
    pub lockfile: HashMap<String, String>,
}

/// GET /api/workflows/{id}/export: pure snapshot.
pub async fn export(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Json<WorkflowExportDocument>, ApiError> {
    let workflow = state
        .engine
        .workflows()
        .get(&principal.tenant_id, &id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("workflow '{}'", id)))?;

    let mut node_types: Vec<String> = workflow.nodes.iter().map(|n| n.node_type.clone()).collect();
    node_types.sort();
    node_types.dedup();

    let mut connectors = Vec::new();
    let mut lockfile = HashMap::new();
    for node_type in node_types {
        if let Some(manifest) = state.connectors.latest_matching(&node_type, None) {
            connectors.push(ConnectorRef {
                id: manifest.id.clone(),
                version: manifest.version.to_string(),
            });
            lockfile.insert(manifest.id.clone(), manifest.version.to_string());
        }
    }

    Ok(Json(WorkflowExportDocument {
        workflow,
        connectors,
        lockfile,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResponse {
    pub workflow_id: String,
    pub resolved_versions: HashMap<String, String>,
}

/// POST /api/workflows/import: validate, then resolve the connector set
/// under the document's lockfile.
pub async fn import(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Json(document): Json<WorkflowExportDocument>,
) -> Result<(StatusCode, Json<ImportResponse>), ApiError> {
    let mut workflow = document.workflow;
    workflow.tenant_id = principal.tenant_id.clone();
    validate_or_reject(&state, &workflow)?;

    let requirements: Vec<(String, VersionReq)> = document
        .connectors
        .iter()
        .map(|c| {
            let range = VersionReq::parse(&format!("={}", c.version))
                .or_else(|_| VersionReq::parse(&c.version))
                .map_err(|e| ApiError::Validation(format!("connector '{}': {}", c.id, e)))?;
            Ok((c.id.clone(), range))
        })
        .collect::<Result<_, ApiError>>()?;

    let lockfile: Lockfile = document
        .lockfile
        .iter()
        .map(|(id, version)| {
            Version::parse(version)
                .map(|v| (id.clone(), v))
                .map_err(|e| ApiError::Validation(format!("lockfile '{}': {}", id, e)))
        })
        .collect::<Result<_, ApiError>>()?;

    let resolver = Resolver::new(&state.connectors, ResolutionStrategy::HighestCompatible)
        .with_lockfile(lockfile);
    let resolved = resolver.resolve(&requirements)?;

    state.engine.workflows().insert(workflow.clone()).await?;
    state.audit.record(
        &principal.tenant_id,
        &principal.user_id,
        "workflow.imported",
        &workflow.id,
        None,
    );

    Ok((
        StatusCode::CREATED,
        Json(ImportResponse {
            workflow_id: workflow.id,
            resolved_versions: resolved
                .into_iter()
                .map(|(id, v)| (id, v.to_string()))
                .collect(),
        }),
    ))
}
