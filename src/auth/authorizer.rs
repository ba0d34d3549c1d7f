// Full authorization flows
// Used when no usable refresh token exists

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use super::endpoint::OAuthTokenEndpoint;
use super::types::TokenExchange;

/// Performs the complete out-of-band authorization for an integration
#[async_trait]
pub trait FullAuthorizer: Send + Sync {
    async fn authorize(&self) -> TokenExchange;
}

/// Resource owner password grant (Digisac)
pub struct PasswordAuthorizer {
    endpoint: Arc<OAuthTokenEndpoint>,
    username: String,
    password: String,
}

impl PasswordAuthorizer {
    pub fn new(
        endpoint: Arc<OAuthTokenEndpoint>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl FullAuthorizer for PasswordAuthorizer {
    async fn authorize(&self) -> TokenExchange {
        tracing::info!(user = %self.username, "Authorizing with password grant");
        self.endpoint
            .password_grant(&self.username, &self.password)
            .await
    }
}

/// Result of handing an OAuth callback to a waiting authorization
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallbackDelivery {
    Delivered,
    NoPendingAuthorization,
    StateMismatch,
}

struct PendingAuthorization {
    state: String,
    sender: oneshot::Sender<String>,
}

struct CodeFlow {
    endpoint: Arc<OAuthTokenEndpoint>,
    authorize_url: String,
    redirect_uri: String,
    scope: Option<String>,
    wait_timeout: Duration,
    pending: Mutex<Option<PendingAuthorization>>,
}

/// Authorization code grant (Conta Azul).
///
/// Logs the provider login URL and waits for the redirect to reach the
/// callback route, which forwards the code through an [`AuthorizationCallback`].
pub struct AuthorizationCodeAuthorizer {
    flow: Arc<CodeFlow>,
}

/// Handle given to the callback route
#[derive(Clone)]
pub struct AuthorizationCallback {
    flow: Arc<CodeFlow>,
}

impl AuthorizationCodeAuthorizer {
    pub fn new(
        endpoint: Arc<OAuthTokenEndpoint>,
        authorize_url: impl Into<String>,
        redirect_uri: impl Into<String>,
        scope: Option<String>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            flow: Arc::new(CodeFlow {
                endpoint,
                authorize_url: authorize_url.into(),
                redirect_uri: redirect_uri.into(),
                scope,
                wait_timeout,
                pending: Mutex::new(None),
            }),
        }
    }

    pub fn callback(&self) -> AuthorizationCallback {
        AuthorizationCallback {
            flow: self.flow.clone(),
        }
    }

    /// Provider login URL for the given `state`
    pub fn authorization_url(&self, state: &str) -> Result<String> {
        let flow = &self.flow;
        let mut url = Url::parse(&flow.authorize_url)
            .with_context(|| format!("Invalid authorize URL: {}", flow.authorize_url))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", flow.endpoint.client_id())
                .append_pair("redirect_uri", &flow.redirect_uri)
                .append_pair("state", state);
            if let Some(ref scope) = flow.scope {
                query.append_pair("scope", scope);
            }
        }
        Ok(url.to_string())
    }

    fn set_pending(&self, pending: Option<PendingAuthorization>) {
        match self.flow.pending.lock() {
            Ok(mut slot) => *slot = pending,
            Err(poisoned) => *poisoned.into_inner() = pending,
        }
    }
}

#[async_trait]
impl FullAuthorizer for AuthorizationCodeAuthorizer {
    async fn authorize(&self) -> TokenExchange {
        let state = uuid::Uuid::new_v4().simple().to_string();
        let url = match self.authorization_url(&state) {
            Ok(url) => url,
            Err(e) => return TokenExchange::Fatal(format!("{:#}", e)),
        };

        let (sender, receiver) = oneshot::channel();
        self.set_pending(Some(PendingAuthorization {
            state: state.clone(),
            sender,
        }));

        tracing::warn!(
            "Authorization required. Open this URL and sign in within {}s: {}",
            self.flow.wait_timeout.as_secs(),
            url
        );

        let code = match tokio::time::timeout(self.flow.wait_timeout, receiver).await {
            Ok(Ok(code)) => code,
            Ok(Err(_)) => {
                return TokenExchange::Fatal("authorization was superseded".to_string());
            }
            Err(_) => {
                self.set_pending(None);
                return TokenExchange::Fatal(format!(
                    "no authorization code received within {}s",
                    self.flow.wait_timeout.as_secs()
                ));
            }
        };

        tracing::info!("Authorization code received, exchanging for tokens");
        self.flow
            .endpoint
            .authorization_code_grant(&code, &self.flow.redirect_uri)
            .await
    }
}

impl AuthorizationCallback {
    /// Forward a code to the authorization currently waiting for it
    pub fn deliver(&self, code: &str, state: Option<&str>) -> CallbackDelivery {
        let mut slot = match self.flow.pending.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };

        let pending = match slot.take() {
            None => return CallbackDelivery::NoPendingAuthorization,
            Some(pending) if state != Some(pending.state.as_str()) => {
                *slot = Some(pending);
                tracing::warn!("OAuth callback state does not match the pending authorization");
                return CallbackDelivery::StateMismatch;
            }
            Some(pending) => pending,
        };

        if pending.sender.send(code.to_string()).is_err() {
            return CallbackDelivery::NoPendingAuthorization;
        }
        CallbackDelivery::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::endpoint::ClientAuthMethod;
    use mockito::Matcher;

    fn endpoint(url: String) -> Arc<OAuthTokenEndpoint> {
        Arc::new(
            OAuthTokenEndpoint::new(url, "ca-client", "ca-secret", ClientAuthMethod::Basic, 5)
                .unwrap(),
        )
    }

    #[test]
    fn test_authorization_url_contains_oauth_parameters() {
        let authorizer = AuthorizationCodeAuthorizer::new(
            endpoint("http://127.0.0.1:1/oauth2/token".to_string()),
            "https://auth.contaazul.com/oauth2/authorize",
            "https://example.com/integrations/conta_azul/callback",
            Some("openid profile".to_string()),
            Duration::from_secs(5),
        );

        let url = Url::parse(&authorizer.authorization_url("xyz").unwrap()).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "ca-client");
        assert_eq!(
            pairs["redirect_uri"],
            "https://example.com/integrations/conta_azul/callback"
        );
        assert_eq!(pairs["state"], "xyz");
        assert_eq!(pairs["scope"], "openid profile");
    }

    #[test]
    fn test_deliver_without_pending_authorization() {
        let authorizer = AuthorizationCodeAuthorizer::new(
            endpoint("http://127.0.0.1:1/token".to_string()),
            "https://auth.example.com/authorize",
            "https://example.com/callback",
            None,
            Duration::from_secs(5),
        );
        assert_eq!(
            authorizer.callback().deliver("code", Some("state")),
            CallbackDelivery::NoPendingAuthorization
        );
    }

    #[tokio::test]
    async fn test_code_flow_waits_for_callback() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "the-code".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"at","refresh_token":"rt","expires_in":3600,"id_token":"idt"}"#)
            .expect(1)
            .create_async()
            .await;

        let authorizer = Arc::new(AuthorizationCodeAuthorizer::new(
            endpoint(format!("{}/oauth2/token", server.url())),
            "https://auth.example.com/authorize",
            "https://example.com/callback",
            None,
            Duration::from_secs(5),
        ));
        let callback = authorizer.callback();

        let task = {
            let authorizer = authorizer.clone();
            tokio::spawn(async move { authorizer.authorize().await })
        };

        // Wait for the authorization to register its state
        let state = loop {
            if let Some(state) = authorizer
                .flow
                .pending
                .lock()
                .unwrap()
                .as_ref()
                .map(|p| p.state.clone())
            {
                break state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        assert_eq!(
            callback.deliver("the-code", Some("wrong")),
            CallbackDelivery::StateMismatch
        );
        assert_eq!(
            callback.deliver("the-code", Some(&state)),
            CallbackDelivery::Delivered
        );

        let outcome = task.await.unwrap();
        assert!(matches!(outcome, TokenExchange::Granted(ref g) if g.id_token.as_deref() == Some("idt")));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_code_flow_times_out() {
        let authorizer = AuthorizationCodeAuthorizer::new(
            endpoint("http://127.0.0.1:1/token".to_string()),
            "https://auth.example.com/authorize",
            "https://example.com/callback",
            None,
            Duration::from_millis(50),
        );

        assert!(matches!(authorizer.authorize().await, TokenExchange::Fatal(_)));
        assert_eq!(
            authorizer.callback().deliver("late", None),
            CallbackDelivery::NoPendingAuthorization
        );
    }
}
