// Scripted token endpoint and authorizer for tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Semaphore;

use super::authorizer::FullAuthorizer;
use super::endpoint::TokenEndpoint;
use super::types::{TokenExchange, TokenGrant};

/// Replays queued outcomes and counts calls.
///
/// When gated, every call waits for a permit from [`ScriptedExchange::release`].
pub struct ScriptedExchange {
    outcomes: Mutex<VecDeque<TokenExchange>>,
    calls: AtomicUsize,
    gate: Option<Semaphore>,
    seen_refresh_tokens: Mutex<Vec<String>>,
}

impl ScriptedExchange {
    pub fn new(outcomes: Vec<TokenExchange>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
            gate: None,
            seen_refresh_tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn gated(outcomes: Vec<TokenExchange>) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(outcomes)
        }
    }

    pub fn release(&self, permits: usize) {
        if let Some(ref gate) = self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_refresh_tokens(&self) -> Vec<String> {
        self.seen_refresh_tokens.lock().unwrap().clone()
    }

    async fn next(&self) -> TokenExchange {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref gate) = self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TokenExchange::Fatal("no scripted outcome left".to_string()))
    }
}

#[async_trait]
impl TokenEndpoint for ScriptedExchange {
    async fn refresh(&self, refresh_token: &str) -> TokenExchange {
        self.seen_refresh_tokens
            .lock()
            .unwrap()
            .push(refresh_token.to_string());
        self.next().await
    }
}

#[async_trait]
impl FullAuthorizer for ScriptedExchange {
    async fn authorize(&self) -> TokenExchange {
        self.next().await
    }
}

pub fn granted(access: &str, refresh: Option<&str>, expires_in: u64) -> TokenExchange {
    TokenExchange::Granted(TokenGrant {
        access_token: access.to_string(),
        refresh_token: refresh.map(str::to_string),
        expires_in: Some(expires_in),
        token_type: Some("Bearer".to_string()),
        scope: None,
        id_token: None,
    })
}

pub fn invalid_grant() -> TokenExchange {
    TokenExchange::Rejected {
        error: "invalid_grant".to_string(),
        description: Some("refresh token revoked".to_string()),
    }
}
