// Error handling module
// Defines the credential error taxonomy and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the credential lifecycle manager.
///
/// `Clone` so that a single in-flight exchange can hand the same outcome to
/// every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// Retryable failure (timeout, connection error, 429, 5xx).
    /// Callers should retry with their own backoff policy.
    #[error("Transient authentication error: {0}")]
    TransientAuthError(String),

    /// Missing credentials or an unrecoverable provider answer.
    /// Requires operator or collaborator action.
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// The refresh token was rejected by the authorization server.
    /// A full authorization is required before tokens can be issued again.
    #[error("Reauthorization required: {0}")]
    ReauthorizationRequired(String),
}

impl AuthError {
    /// Whether the caller may retry the same operation after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::TransientAuthError(_))
    }

    /// Short machine-readable kind, used in logs and API responses
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::TransientAuthError(_) => "transient_auth_error",
            AuthError::AuthenticationError(_) => "authentication_error",
            AuthError::ReauthorizationRequired(_) => "reauthorization_required",
        }
    }
}

/// API errors returned by the admin HTTP surface
#[derive(Error, Debug)]
pub enum ApiError {
    /// Caller failed admin authentication
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown integration identity
    #[error("Integration not found: {0}")]
    NotFound(String),

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Credential lifecycle failure
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Error from the upstream API called through the authorized client
    #[error("Upstream API error: {status} - {message}")]
    UpstreamError { status: u16, message: String },

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::Auth(err) => {
                let status = match err {
                    AuthError::TransientAuthError(_) => StatusCode::SERVICE_UNAVAILABLE,
                    AuthError::AuthenticationError(_) | AuthError::ReauthorizationRequired(_) => {
                        StatusCode::UNAUTHORIZED
                    }
                };
                (status, err.kind(), err.to_string())
            }
            ApiError::UpstreamError { status, message } => {
                let status_code =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status_code, "upstream_error", message)
            }
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}
