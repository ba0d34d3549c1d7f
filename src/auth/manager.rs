use anyhow::Result;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::authorizer::FullAuthorizer;
use super::endpoint::TokenEndpoint;
use super::types::{
    token_prefix, CredentialRecord, CredentialStatus, ManagerSettings, TokenExchange,
};
use crate::error::AuthError;
use crate::store::CredentialStore;

type SharedOutcome = Shared<BoxFuture<'static, Result<String, AuthError>>>;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ExchangeKind {
    Refresh,
    FullAuthorization,
}

/// The single exchange currently running for this integration
struct InFlight {
    id: u64,
    kind: ExchangeKind,
    outcome: SharedOutcome,
}

struct ManagerState {
    record: Option<CredentialRecord>,
    in_flight: Option<InFlight>,
    next_flight_id: u64,
}

struct Inner {
    integration: String,
    settings: ManagerSettings,
    endpoint: Arc<dyn TokenEndpoint>,
    store: Arc<dyn CredentialStore>,
    authorizer: Option<Arc<dyn FullAuthorizer>>,
    state: Mutex<ManagerState>,
}

/// Credential lifecycle manager for one integration identity.
///
/// Hands out access tokens, refreshing or re-authorizing when the cached one
/// is inside the safety margin. At most one exchange runs at a time; callers
/// arriving while it runs await the same outcome. The exchange runs on its own
/// task, so a caller giving up early does not abort it.
pub struct CredentialManager {
    inner: Arc<Inner>,
}

impl CredentialManager {
    /// Create a manager, loading any persisted record for `integration`
    pub fn new(
        integration: impl Into<String>,
        settings: ManagerSettings,
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn CredentialStore>,
        authorizer: Option<Arc<dyn FullAuthorizer>>,
    ) -> Result<Self> {
        let integration = integration.into();
        let record = store.load(&integration)?;

        match record {
            Some(ref r) => tracing::info!(
                integration = %integration,
                expires_at = %r.expires_at.to_rfc3339(),
                has_refresh_token = r.refresh_token.is_some(),
                "Loaded persisted credentials"
            ),
            None => tracing::info!(
                integration = %integration,
                "No persisted credentials, full authorization will run on first use"
            ),
        }

        Ok(Self {
            inner: Arc::new(Inner {
                integration,
                settings,
                endpoint,
                store,
                authorizer,
                state: Mutex::new(ManagerState {
                    record,
                    in_flight: None,
                    next_flight_id: 0,
                }),
            }),
        })
    }

    pub fn integration(&self) -> &str {
        &self.inner.integration
    }

    /// Get a valid access token, refreshing or re-authorizing if necessary
    pub async fn get_valid_token(&self) -> Result<String, AuthError> {
        let outcome = {
            let mut state = self.inner.state.lock().await;
            match state.in_flight.as_ref().map(|f| f.outcome.clone()) {
                Some(running) => {
                    tracing::debug!(
                        integration = %self.inner.integration,
                        "Waiting for in-flight credential exchange"
                    );
                    running
                }
                None => {
                    let kind = match state.record {
                        Some(ref record)
                            if !record
                                .needs_refresh(self.inner.settings.safety_margin, Utc::now()) =>
                        {
                            return Ok(record.access_token.clone());
                        }
                        Some(ref record) if record.refresh_token.is_some() => ExchangeKind::Refresh,
                        _ => ExchangeKind::FullAuthorization,
                    };
                    self.start(&mut state, kind)
                }
            }
        };

        outcome.await
    }

    /// Exchange the refresh token for a new access token now
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let outcome = {
            let mut state = self.inner.state.lock().await;
            match state.in_flight.as_ref().map(|f| f.outcome.clone()) {
                Some(running) => running,
                None => {
                    let has_refresh_token = state
                        .record
                        .as_ref()
                        .is_some_and(|r| r.refresh_token.is_some());
                    if !has_refresh_token {
                        return Err(AuthError::ReauthorizationRequired(format!(
                            "no refresh token available for {}",
                            self.inner.integration
                        )));
                    }
                    self.start(&mut state, ExchangeKind::Refresh)
                }
            }
        };

        outcome.await.map(|_| ())
    }

    /// Run the full authorization flow now, replacing any existing record.
    /// A refresh already in flight is allowed to settle first.
    pub async fn full_authorize(&self) -> Result<(), AuthError> {
        let outcome = loop {
            let mut state = self.inner.state.lock().await;
            let running = state
                .in_flight
                .as_ref()
                .map(|f| (f.kind, f.outcome.clone()));

            match running {
                Some((ExchangeKind::FullAuthorization, running)) => break running,
                Some((ExchangeKind::Refresh, running)) => {
                    drop(state);
                    let _ = running.await;
                }
                None => break self.start(&mut state, ExchangeKind::FullAuthorization),
            }
        };

        outcome.await.map(|_| ())
    }

    /// Treat `rejected_token` as expired so the next caller refreshes.
    /// No-op when the cached token has already been replaced.
    pub async fn invalidate_access_token(&self, rejected_token: &str) {
        let mut state = self.inner.state.lock().await;
        if let Some(ref mut record) = state.record {
            if record.access_token == rejected_token {
                tracing::warn!(
                    integration = %self.inner.integration,
                    token = %token_prefix(rejected_token),
                    "Access token rejected by API, marking as expired"
                );
                record.expires_at = Utc::now();
                self.inner.persist(record).await;
            }
        }
    }

    /// Token-free snapshot of the current record
    pub async fn status(&self) -> CredentialStatus {
        let state = self.inner.state.lock().await;
        let now = Utc::now();
        let record = state.record.as_ref();

        CredentialStatus {
            integration: self.inner.integration.clone(),
            has_access_token: record.is_some(),
            has_refresh_token: record.is_some_and(|r| r.refresh_token.is_some()),
            expires_at: record.map(|r| r.expires_at),
            acquired_at: record.map(|r| r.acquired_at),
            seconds_remaining: record.map(|r| (r.expires_at - now).num_seconds()),
            refresh_in_flight: state.in_flight.is_some(),
        }
    }

    /// Time until the cached token enters the safety margin (zero if already inside it)
    pub async fn next_refresh_delay(&self) -> Duration {
        let state = self.inner.state.lock().await;
        match state.record {
            Some(ref record) => {
                let due = record.expires_at - self.inner.settings.safety_margin;
                (due - Utc::now()).to_std().unwrap_or(Duration::ZERO)
            }
            None => Duration::ZERO,
        }
    }

    /// Spawn an exchange and register it as the in-flight one.
    /// Must be called with the state lock held and no exchange running.
    fn start(&self, state: &mut ManagerState, kind: ExchangeKind) -> SharedOutcome {
        let id = state.next_flight_id;
        state.next_flight_id += 1;

        let refresh_token = state.record.as_ref().and_then(|r| r.refresh_token.clone());
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let exchange = AssertUnwindSafe(inner.exchange(kind, refresh_token));
            let result = match exchange.catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(AuthError::TransientAuthError(
                    "credential exchange panicked".to_string(),
                )),
            };
            inner.finish(id, &result).await;
            result
        });

        let watcher = self.inner.clone();
        let outcome = async move {
            match handle.await {
                Ok(result) => result,
                // Task cancelled before it could release the slot (runtime shutdown)
                Err(e) => {
                    let result = Err(AuthError::TransientAuthError(format!(
                        "credential exchange task failed: {}",
                        e
                    )));
                    watcher.finish(id, &result).await;
                    result
                }
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(InFlight {
            id,
            kind,
            outcome: outcome.clone(),
        });
        outcome
    }
}

impl Inner {
    async fn exchange(
        &self,
        kind: ExchangeKind,
        refresh_token: Option<String>,
    ) -> Result<String, AuthError> {
        match (kind, refresh_token) {
            (ExchangeKind::Refresh, Some(refresh_token)) => self.refresh(&refresh_token).await,
            _ => self.full_authorize().await,
        }
    }

    /// Release the in-flight slot held by exchange `id`, however it ended
    async fn finish(&self, id: u64, result: &Result<String, AuthError>) {
        let mut state = self.state.lock().await;
        if state.in_flight.as_ref().is_some_and(|f| f.id == id) {
            state.in_flight = None;
        }
        drop(state);

        if let Err(ref e) = result {
            tracing::error!(
                integration = %self.integration,
                kind = e.kind(),
                "Credential exchange failed: {}",
                e
            );
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String, AuthError> {
        tracing::info!(integration = %self.integration, "Refreshing access token...");

        match self.endpoint.refresh(refresh_token).await {
            TokenExchange::Granted(grant) => {
                let now = Utc::now();
                let mut state = self.state.lock().await;
                let record = match state.record.take() {
                    Some(mut record) => {
                        record.apply_refresh(&grant, self.settings.default_lifetime, now);
                        record
                    }
                    None => CredentialRecord::from_grant(&grant, self.settings.default_lifetime, now),
                };
                self.persist(&record).await;
                let token = record.access_token.clone();

                tracing::info!(
                    integration = %self.integration,
                    expires_at = %record.expires_at.to_rfc3339(),
                    "Access token refreshed"
                );
                state.record = Some(record);
                Ok(token)
            }
            TokenExchange::Rejected { error, description } => {
                let mut state = self.state.lock().await;
                if let Some(ref mut record) = state.record {
                    // Only clear the token that was actually rejected
                    if record.refresh_token.as_deref() == Some(refresh_token) {
                        record.refresh_token = None;
                        record.expires_at = record.expires_at.min(Utc::now());
                        self.persist(record).await;
                    }
                }

                tracing::warn!(
                    integration = %self.integration,
                    error = %error,
                    "Refresh token rejected, full authorization required"
                );
                Err(AuthError::ReauthorizationRequired(match description {
                    Some(d) => format!("{}: {}", error, d),
                    None => error,
                }))
            }
            TokenExchange::Transient(reason) => Err(AuthError::TransientAuthError(reason)),
            TokenExchange::Fatal(reason) => Err(AuthError::AuthenticationError(reason)),
        }
    }

    async fn full_authorize(&self) -> Result<String, AuthError> {
        let authorizer = self.authorizer.as_ref().ok_or_else(|| {
            AuthError::AuthenticationError(format!(
                "no refresh token available for {} and no full authorization flow configured",
                self.integration
            ))
        })?;

        tracing::info!(integration = %self.integration, "Running full authorization...");

        let grant = authorizer.authorize().await.into_authorization()?;
        let record = CredentialRecord::from_grant(&grant, self.settings.default_lifetime, Utc::now());
        if record.refresh_token.is_none() {
            tracing::warn!(
                integration = %self.integration,
                "Authorization did not return a refresh token"
            );
        }

        let mut state = self.state.lock().await;
        self.persist(&record).await;
        let token = record.access_token.clone();
        state.record = Some(record);

        tracing::info!(integration = %self.integration, "Full authorization succeeded");
        Ok(token)
    }

    /// Best-effort write; the in-memory record stays authoritative.
    /// Callers hold the state lock, so writes reach the store in order.
    async fn persist(&self, record: &CredentialRecord) {
        let store = self.store.clone();
        let integration = self.integration.clone();
        let record = record.clone();

        let saved = tokio::task::spawn_blocking(move || store.save(&integration, &record))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|result| result);

        if let Err(e) = saved {
            tracing::error!(
                integration = %self.integration,
                "Failed to persist credentials: {:#}",
                e
            );
        }
    }
}
