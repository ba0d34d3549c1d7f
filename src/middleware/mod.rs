// Admin authentication middleware

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};

use crate::error::ApiError;
use crate::routes::AppState;

/// Authentication middleware
///
/// Verifies the admin key in the Authorization header or x-api-key header.
/// Expects format: "Bearer {ADMIN_API_KEY}" or just the key in x-api-key.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    if bearer == Some(state.admin_api_key.as_str()) || api_key == Some(state.admin_api_key.as_str())
    {
        return Ok(next.run(request).await);
    }

    let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    tracing::warn!(
        "[{}] Access attempt with invalid or missing API key: {} {}",
        request_id,
        request.method(),
        request.uri().path()
    );
    Err(ApiError::Unauthorized(
        "Invalid or missing API Key".to_string(),
    ))
}
