use anyhow::{Context, Result};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::CredentialManager;
use crate::error::ApiError;

/// HTTP client for an integration's API.
///
/// Attaches the integration's bearer token and owns the retry policy the
/// credential manager leaves to its callers.
pub struct AuthorizedHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Credentials of the integration this client talks to
    manager: Arc<CredentialManager>,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl AuthorizedHttpClient {
    pub fn new(
        manager: Arc<CredentialManager>,
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
        base_delay_ms: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            manager,
            max_retries,
            base_delay_ms,
        })
    }

    /// Execute a request with a valid bearer token.
    /// Automatically handles:
    /// - transient token failures: exponential backoff
    /// - 401: marks the token as rejected and retries once with a fresh one
    /// - 429 / 5xx / network errors: exponential backoff
    pub async fn execute(&self, request: Request) -> Result<Response, ApiError> {
        let mut attempt = 0;
        let mut reauthorized = false;

        let method = request.method().clone();
        let url = request.url().clone();
        let integration = self.manager.integration().to_string();

        loop {
            let token = match self.manager.get_valid_token().await {
                Ok(token) => token,
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.calculate_backoff_delay(attempt);
                    tracing::warn!(
                        integration = %integration,
                        "Token unavailable: {}, retrying after {}ms (attempt {}/{})",
                        e,
                        delay,
                        attempt + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => {
                    if !e.is_retryable() {
                        tracing::error!(
                            integration = %integration,
                            kind = e.kind(),
                            "Credentials need operator attention: {}",
                            e
                        );
                    }
                    return Err(ApiError::Auth(e));
                }
            };

            let mut req = request.try_clone().ok_or_else(|| {
                ApiError::Internal(anyhow::anyhow!("Request body is not cloneable"))
            })?;
            let header = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("Access token is not a valid header value")?;
            req.headers_mut().insert(AUTHORIZATION, header);

            tracing::debug!(
                method = %method,
                url = %url,
                attempt = attempt + 1,
                "Executing request attempt"
            );

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    match status {
                        StatusCode::UNAUTHORIZED if !reauthorized => {
                            tracing::warn!(
                                integration = %integration,
                                url = %url,
                                "Received 401, refreshing token and retrying..."
                            );
                            self.manager.invalidate_access_token(&token).await;
                            reauthorized = true;
                            continue;
                        }
                        s if (s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error())
                            && attempt < self.max_retries =>
                        {
                            let delay = self.calculate_backoff_delay(attempt);
                            tracing::warn!(
                                "Received {}, retrying after {}ms (attempt {}/{})",
                                status,
                                delay,
                                attempt + 1,
                                self.max_retries
                            );
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            attempt += 1;
                            continue;
                        }
                        _ => {}
                    }

                    // Non-retryable error or max retries exceeded
                    let error_text = response.text().await.unwrap_or_default();
                    tracing::error!(
                        status = status.as_u16(),
                        url = %url,
                        response_body = %error_text,
                        attempt = attempt + 1,
                        "HTTP request failed with error response"
                    );
                    return Err(ApiError::UpstreamError {
                        status: status.as_u16(),
                        message: error_text,
                    });
                }

                Err(e) => {
                    if attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            error = %e,
                            url = %url,
                            "Request failed, retrying after {}ms (attempt {}/{})",
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error = %e,
                        url = %url,
                        total_attempts = attempt + 1,
                        "HTTP request failed after all retries"
                    );
                    return Err(ApiError::Internal(anyhow::anyhow!(
                        "HTTP request failed: {}",
                        e
                    )));
                }
            }
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // base_delay * 2^attempt, plus up to 10% jitter
        let delay = self.base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
        let jitter = (delay as f64 * 0.1 * rand::random::<f64>()) as u64;
        delay + jitter
    }

    /// Get the underlying HTTP client (for building requests)
    pub fn client(&self) -> &Client {
        &self.client
    }
}
