//! Connector Registry Endpoints
//!
//! Registry listing, registry-document import, and resolution preview for
//! the canvas.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use nx_registry::{
    ConnectorManifest, Lockfile, RegistryDocument, ResolutionOutcome, ResolutionStrategy,
    Resolver,
};

use crate::auth::AuthPrincipal;
use crate::error::ApiError;
use crate::state::AppState;

/// GET /api/connectors
pub async fn list(
    State(state): State<AppState>,
    _principal: AuthPrincipal,
) -> Json<Vec<ConnectorManifest>> {
    Json(state.connectors.export_document().connectors)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResponse {
    pub imported: usize,
}

/// POST /api/connectors/import: registry document (schema, registryVersion,
/// lastUpdated, connectors[]).
pub async fn import(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Json(document): Json<RegistryDocument>,
) -> Result<(StatusCode, Json<ImportResponse>), ApiError> {
    if !principal.has_permission("connectors:manage") {
        return Err(ApiError::Forbidden("connectors:manage required".into()));
    }
    let imported = state.connectors.import_document(document);
    state.audit.record(
        &principal.tenant_id,
        &principal.user_id,
        "connectors.imported",
        "",
        Some(serde_json::json!({ "imported": imported })),
    );
    Ok((StatusCode::CREATED, Json(ImportResponse { imported })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    /// id -> version range
    pub requirements: HashMap<String, String>,
    #[serde(default)]
    pub lockfile: HashMap<String, String>,
    #[serde(default)]
    pub strategy: Option<String>,
}

/// POST /api/connectors/resolve: preview resolution for a requirement set.
pub async fn resolve(
    State(state): State<AppState>,
    _principal: AuthPrincipal,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolutionOutcome>, ApiError> {
    let strategy = match request.strategy.as_deref() {
        None | Some("HighestCompatible") => ResolutionStrategy::HighestCompatible,
        Some("PreferStable") => ResolutionStrategy::PreferStable,
        Some("FailFast") => ResolutionStrategy::FailFast,
        Some(other) => {
            return Err(ApiError::Validation(format!("unknown strategy '{}'", other)))
        }
    };

    let requirements: Vec<(String, VersionReq)> = request
        .requirements
        .iter()
        .map(|(id, range)| {
            VersionReq::parse(range)
                .map(|r| (id.clone(), r))
                .map_err(|e| ApiError::Validation(format!("range for '{}': {}", id, e)))
        })
        .collect::<Result<_, ApiError>>()?;

    let lockfile: Lockfile = request
        .lockfile
        .iter()
        .map(|(id, version)| {
            Version::parse(version)
                .map(|v| (id.clone(), v))
                .map_err(|e| ApiError::Validation(format!("lockfile '{}': {}", id, e)))
        })
        .collect::<Result<_, ApiError>>()?;

    let resolver = Resolver::new(&state.connectors, strategy).with_lockfile(lockfile);
    // the outcome carries success/error; the preview endpoint never 4xxes on
    // an unsatisfiable set
    Ok(Json(ResolutionOutcome::from(resolver.resolve(&requirements))))
}
