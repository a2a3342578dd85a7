//! Authentication
//!
//! Request authentication yielding a `Principal`:
//! - `Authorization: Bearer <jwt>` validated HS256 against the configured
//!   secret/issuer/audience
//! - `X-API-Key: <key>` looked up by SHA-256 hash
//! - `X-Tenant-ID` overrides the principal's tenant (system admins only)
//!
//! In dev mode an unauthenticated request gets the configured default
//! tenant instead of a 401.

use axum::extract::FromRequestParts;
use axum::http::{header::AUTHORIZATION, request::Parts};
use dashmap::DashMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;

use nx_common::Principal;
use nx_config::JwtOptions;

use crate::error::ApiError;
use crate::state::AppState;

const API_KEY_HEADER: &str = "x-api-key";
const TENANT_OVERRIDE_HEADER: &str = "x-tenant-id";

/// JWT claims accepted by the platform.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default, alias = "tid")]
    tenant_id: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    permissions: Vec<String>,
    #[allow(dead_code)]
    exp: usize,
}

/// API keys held as SHA-256 hex digests mapped to principals.
pub struct ApiKeyStore {
    keys: DashMap<String, Principal>,
}

impl ApiKeyStore {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    pub fn register(&self, key: &str, principal: Principal) {
        self.keys.insert(hash_key(key), principal);
    }

    pub fn lookup(&self, key: &str) -> Option<Principal> {
        self.keys.get(&hash_key(key)).map(|p| p.clone())
    }

    pub fn revoke(&self, key: &str) -> bool {
        self.keys.remove(&hash_key(key)).is_some()
    }
}

impl Default for ApiKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Validate a bearer token against the JWT options.
pub fn validate_jwt(token: &str, options: &JwtOptions) -> Result<Principal, ApiError> {
    let mut validation = Validation::new(Algorithm::HS256);
    if !options.issuer.is_empty() {
        validation.set_issuer(&[&options.issuer]);
    }
    if !options.audience.is_empty() {
        validation.set_audience(&[&options.audience]);
    }

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(options.secret_key.as_bytes()),
        &validation,
    )
    .map_err(|e| ApiError::Unauthorized(format!("invalid token: {}", e)))?;

    let claims = data.claims;
    if claims.tenant_id.is_empty() {
        return Err(ApiError::Unauthorized("token carries no tenant".into()));
    }
    Ok(Principal {
        tenant_id: claims.tenant_id,
        user_id: claims.sub,
        roles: claims.roles.into_iter().collect::<HashSet<_>>(),
        permissions: claims.permissions.into_iter().collect::<HashSet<_>>(),
    })
}

/// Authenticated principal extractor.
pub struct AuthPrincipal(pub Principal);

impl std::ops::Deref for AuthPrincipal {
    type Target = Principal;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromRequestParts<AppState> for AuthPrincipal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let mut principal = authenticate(parts, state)?;

        // tenant override is an admin capability
        if let Some(tenant) = header_value(parts, TENANT_OVERRIDE_HEADER) {
            if tenant != principal.tenant_id {
                if !principal.is_system_admin() {
                    state.audit.record(
                        &principal.tenant_id,
                        &principal.user_id,
                        "auth.tenant_override_denied",
                        &tenant,
                        None,
                    );
                    return Err(ApiError::Forbidden(
                        "tenant override requires system-admin".into(),
                    ));
                }
                debug!(
                    user_id = %principal.user_id,
                    tenant_id = %tenant,
                    "System admin tenant override"
                );
                principal.tenant_id = tenant;
            }
        }

        Ok(AuthPrincipal(principal))
    }
}

fn authenticate(parts: &Parts, state: &AppState) -> Result<Principal, ApiError> {
    if let Some(token) = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return match validate_jwt(token, &state.config.jwt) {
            Ok(principal) => Ok(principal),
            Err(e) => {
                state
                    .audit
                    .record("", "", "auth.jwt_rejected", "", None);
                Err(e)
            }
        };
    }

    if let Some(key) = header_value(parts, API_KEY_HEADER) {
        return match state.api_keys.lookup(&key) {
            Some(principal) => Ok(principal),
            None => {
                state
                    .audit
                    .record("", "", "auth.api_key_rejected", "", None);
                Err(ApiError::Unauthorized("unknown API key".into()))
            }
        };
    }

    if state.config.dev_mode {
        return Ok(Principal::new(
            state.config.default_tenant_id.clone(),
            "dev-user",
        ));
    }

    Err(ApiError::Unauthorized("missing credentials".into()))
}

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}
