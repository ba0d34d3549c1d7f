// HTTP routes
// Health, integration status, forced refresh and the OAuth callback

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware as axum_middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::{CallbackDelivery, CredentialManager, CredentialRegistry};
use crate::error::ApiError;
use crate::middleware;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub admin_api_key: String,
    pub registry: CredentialRegistry,
}

impl AppState {
    fn manager(&self, integration: &str) -> Result<Arc<CredentialManager>, ApiError> {
        self.registry
            .get(integration)
            .ok_or_else(|| ApiError::NotFound(integration.to_string()))
    }
}

/// Health check routes (no authentication, for load balancers)
pub fn health_routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Admin routes (require authentication)
pub fn admin_routes(state: AppState) -> Router {
    Router::new()
        .route("/integrations", get(list_integrations_handler))
        .route("/integrations/:id", get(integration_status_handler))
        .route("/integrations/:id/refresh", post(refresh_handler))
        .route("/integrations/:id/authorize", post(authorize_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// OAuth redirect target. Not behind the admin key since the provider's redirect
/// carries no credentials. A code is only accepted by an authorization that is
/// waiting for it with a matching `state`.
pub fn callback_routes(state: AppState) -> Router {
    Router::new()
        .route("/integrations/:id/callback", get(callback_handler))
        .with_state(state)
}

/// All routes merged
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health_routes(state.clone()))
        .merge(admin_routes(state.clone()))
        .merge(callback_routes(state))
}

/// GET /
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Credential Manager is running",
        "version": VERSION
    }))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": VERSION,
        "integrations": state.registry.integrations(),
    }))
}

/// GET /integrations - token-free status of every integration
async fn list_integrations_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "integrations": state.registry.statuses().await }))
}

/// GET /integrations/:id
async fn integration_status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let manager = state.manager(&id)?;
    Ok(Json(json!(manager.status().await)))
}

/// POST /integrations/:id/refresh - force a refresh (joins one already running)
async fn refresh_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let manager = state.manager(&id)?;
    tracing::info!(integration = %id, "Forced refresh requested");

    manager.refresh().await?;
    Ok(Json(json!(manager.status().await)))
}

/// POST /integrations/:id/authorize - start a full authorization in the background
async fn authorize_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let manager = state.manager(&id)?;
    tracing::info!(integration = %id, "Full authorization requested");

    tokio::spawn(async move {
        if let Err(e) = manager.full_authorize().await {
            tracing::error!(integration = %manager.integration(), "Full authorization failed: {}", e);
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "authorization_started", "integration": id })),
    ))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /integrations/:id/callback?code=...&state=...
async fn callback_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<Value>, ApiError> {
    if let Some(error) = query.error {
        tracing::warn!(integration = %id, error = %error, "Provider returned an authorization error");
        return Err(ApiError::ValidationError(format!(
            "authorization failed: {}{}",
            error,
            query
                .error_description
                .map(|d| format!(" - {}", d))
                .unwrap_or_default()
        )));
    }

    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::ValidationError("missing 'code' parameter".to_string()))?;

    state.manager(&id)?;
    let callback = state.registry.callback(&id).ok_or_else(|| {
        ApiError::ValidationError(format!(
            "{} does not use the authorization code flow",
            id
        ))
    })?;

    match callback.deliver(&code, query.state.as_deref()) {
        CallbackDelivery::Delivered => Ok(Json(json!({
            "status": "code_received",
            "integration": id,
        }))),
        CallbackDelivery::StateMismatch => Err(ApiError::ValidationError(
            "state does not match the pending authorization".to_string(),
        )),
        CallbackDelivery::NoPendingAuthorization => {
            tracing::warn!(integration = %id, "Callback received with no authorization waiting");
            Err(ApiError::ValidationError(
                "no authorization is waiting for a code".to_string(),
            ))
        }
    }
}
