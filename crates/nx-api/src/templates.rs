//! Template Endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;

use nx_template::Template;

use crate::auth::AuthPrincipal;
use crate::error::ApiError;
use crate::state::AppState;

/// PUT /api/templates
pub async fn upsert(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Json(mut template): Json<Template>,
) -> Result<StatusCode, ApiError> {
    template.tenant_id = principal.tenant_id.clone();
    state.templates.upsert(template)?;
    Ok(StatusCode::OK)
}

/// GET /api/templates
pub async fn list(
    State(state): State<AppState>,
    principal: AuthPrincipal,
) -> Json<Vec<Template>> {
    Json(state.templates.list(&principal.tenant_id, None))
}

/// GET /api/templates/{id}
pub async fn get(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Json<Template>, ApiError> {
    state
        .templates
        .get(&principal.tenant_id, &id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("template '{}'", id)))
}

/// DELETE /api/templates/{id}
pub async fn delete(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.templates.delete(&principal.tenant_id, &id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("template '{}'", id)))
    }
}
