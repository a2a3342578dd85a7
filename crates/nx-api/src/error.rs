//! API Error Types
//!
//! One error enum for the whole REST surface with an HTTP status mapping.
//! Handlers return `Result<_, ApiError>`; subsystem errors convert in.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;

use nx_common::{ErrorKind, NotifyError};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Dependency unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<NotifyError> for ApiError {
    fn from(err: NotifyError) -> Self {
        match err.kind() {
            ErrorKind::Validation => ApiError::Validation(err.to_string()),
            ErrorKind::RateLimited => ApiError::RateLimited,
            ErrorKind::Configuration => ApiError::Unavailable(err.to_string()),
            ErrorKind::Resolution => ApiError::Validation(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<nx_workflow::WorkflowError> for ApiError {
    fn from(err: nx_workflow::WorkflowError) -> Self {
        use nx_workflow::WorkflowError;
        match err {
            WorkflowError::NotFound(id) => ApiError::NotFound(id),
            WorkflowError::Validation(message) => ApiError::Validation(message),
            WorkflowError::Conflict(message) => ApiError::Conflict(message),
            WorkflowError::Credential(message) => ApiError::Validation(message),
            WorkflowError::Execution(message) => ApiError::Internal(message),
        }
    }
}

impl From<nx_registry::RegistryError> for ApiError {
    fn from(err: nx_registry::RegistryError) -> Self {
        use nx_registry::RegistryError;
        match err {
            RegistryError::DuplicateVersion { .. } => ApiError::Conflict(err.to_string()),
            RegistryError::UnknownConnector(_) => ApiError::NotFound(err.to_string()),
            RegistryError::InvalidRange(_) => ApiError::Validation(err.to_string()),
            RegistryError::Resolution(_) => ApiError::Validation(err.to_string()),
        }
    }
}

impl From<nx_template::TemplateError> for ApiError {
    fn from(err: nx_template::TemplateError) -> Self {
        match err {
            nx_template::TemplateError::NotFound(id) => ApiError::NotFound(id),
            nx_template::TemplateError::Invalid(message) => ApiError::Validation(message),
        }
    }
}

impl From<nx_rules::RuleError> for ApiError {
    fn from(err: nx_rules::RuleError) -> Self {
        match err {
            nx_rules::RuleError::NotFound(id) => ApiError::NotFound(id),
            nx_rules::RuleError::Invalid(message) => ApiError::Validation(message),
        }
    }
}
