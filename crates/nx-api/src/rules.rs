//! Rule Endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;

use nx_rules::Rule;

use crate::auth::AuthPrincipal;
use crate::error::ApiError;
use crate::state::AppState;

/// PUT /api/rules
pub async fn upsert(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Json(mut rule): Json<Rule>,
) -> Result<StatusCode, ApiError> {
    rule.tenant_id = principal.tenant_id.clone();
    state.rules.upsert(rule)?;
    Ok(StatusCode::OK)
}

/// GET /api/rules
pub async fn list(State(state): State<AppState>, principal: AuthPrincipal) -> Json<Vec<Rule>> {
    Json(state.rules.list(&principal.tenant_id))
}

/// GET /api/rules/{id}
pub async fn get(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<Json<Rule>, ApiError> {
    state
        .rules
        .get(&principal.tenant_id, &id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("rule '{}'", id)))
}

/// DELETE /api/rules/{id}
pub async fn delete(
    State(state): State<AppState>,
    principal: AuthPrincipal,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.rules.delete(&principal.tenant_id, &id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("rule '{}'", id)))
    }
}
