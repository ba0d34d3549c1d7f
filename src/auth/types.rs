// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Current authorization state for one external integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,

    /// Absent before the first full authorization, and after the
    /// authorization server rejected the previous one
    pub refresh_token: Option<String>,

    pub expires_at: DateTime<Utc>,

    /// Last successful acquisition (audit/debug only)
    pub acquired_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// Build a record from a freshly issued grant
    pub fn from_grant(grant: &TokenGrant, default_lifetime: u64, now: DateTime<Utc>) -> Self {
        Self {
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token.clone(),
            expires_at: grant.expires_at(default_lifetime, now),
            acquired_at: now,
        }
    }

    /// Apply a refresh grant in place. The refresh token is kept when the
    /// provider does not rotate it.
    pub fn apply_refresh(
        &mut self,
        grant: &TokenGrant,
        default_lifetime: u64,
        now: DateTime<Utc>,
    ) {
        self.access_token = grant.access_token.clone();
        if let Some(ref rotated) = grant.refresh_token {
            self.refresh_token = Some(rotated.clone());
        }
        self.expires_at = grant.expires_at(default_lifetime, now);
        self.acquired_at = now;
    }

    /// Whether the access token has less than `margin` of lifetime left
    pub fn needs_refresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - now < margin
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Successful token endpoint response, decoded at the boundary
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// OpenID providers (Conta Azul) also return an id token
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Upper bound on a token lifetime (ten years). Anything longer from the
/// provider is treated as this.
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 10 * 365 * 24 * 60 * 60;

impl TokenGrant {
    pub fn expires_at(&self, default_lifetime: u64, now: DateTime<Utc>) -> DateTime<Utc> {
        let lifetime = self.expires_in.unwrap_or(default_lifetime);
        let seconds = i64::try_from(lifetime)
            .unwrap_or(MAX_TOKEN_LIFETIME_SECS)
            .min(MAX_TOKEN_LIFETIME_SECS);

        now.checked_add_signed(Duration::seconds(seconds))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// OAuth2 error body (RFC 6749 section 5.2)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Outcome of one call to a token endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum TokenExchange {
    /// New tokens were issued
    Granted(TokenGrant),

    /// The authorization server rejected the grant outright (`invalid_grant`)
    Rejected {
        error: String,
        description: Option<String>,
    },

    /// Timeout, connection failure, 429, 5xx or an unreadable success body
    Transient(String),

    /// Any other refusal (bad client credentials, malformed request).
    /// Retrying will not help.
    Fatal(String),
}

impl TokenExchange {
    /// Outcome of a full authorization (or code exchange) as a result.
    /// A rejection here concerns the authorization itself, not a refresh token.
    pub fn into_authorization(self) -> Result<TokenGrant, AuthError> {
        match self {
            TokenExchange::Granted(grant) => Ok(grant),
            TokenExchange::Transient(reason) => Err(AuthError::TransientAuthError(reason)),
            TokenExchange::Rejected { error, description } => {
                Err(AuthError::AuthenticationError(format!(
                    "authorization rejected: {}{}",
                    error,
                    description.map(|d| format!(" - {}", d)).unwrap_or_default()
                )))
            }
            TokenExchange::Fatal(reason) => Err(AuthError::AuthenticationError(reason)),
        }
    }
}

/// Token-free view of a credential record
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub integration: String,
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub acquired_at: Option<DateTime<Utc>>,
    /// Negative once the token has expired
    pub seconds_remaining: Option<i64>,
    pub refresh_in_flight: bool,
}

/// Tunables for a credential manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Tokens with less lifetime than this are refreshed before being handed out
    pub safety_margin: Duration,

    /// Lifetime assumed when the provider omits `expires_in`, in seconds
    pub default_lifetime: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            safety_margin: Duration::seconds(60),
            default_lifetime: 3600,
        }
    }
}

/// Mask a token for log output
pub fn token_prefix(token: &str) -> String {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(idx, _)| idx)
        .unwrap_or(token.len());
    format!("{}...", &token[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(access: &str, refresh: Option<&str>, expires_in: Option<u64>) -> TokenGrant {
        TokenGrant {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_in,
            token_type: Some("Bearer".to_string()),
            scope: None,
            id_token: None,
        }
    }

    #[test]
    fn test_from_grant_uses_default_lifetime() {
        let now = Utc::now();
        let record = CredentialRecord::from_grant(&grant("a", Some("r"), None), 3600, now);
        assert_eq!(record.expires_at, now + Duration::seconds(3600));
        assert_eq!(record.acquired_at, now);
        assert_eq!(record.refresh_token.as_deref(), Some("r"));
    }

    #[test]
    fn test_apply_refresh_keeps_refresh_token_when_not_rotated() {
        let now = Utc::now();
        let mut record = CredentialRecord::from_grant(&grant("a1", Some("r1"), Some(60)), 3600, now);

        record.apply_refresh(&grant("a2", None, Some(1800)), 3600, now);
        assert_eq!(record.access_token, "a2");
        assert_eq!(record.refresh_token.as_deref(), Some("r1"));
        assert_eq!(record.expires_at, now + Duration::seconds(1800));

        record.apply_refresh(&grant("a3", Some("r2"), Some(1800)), 3600, now);
        assert_eq!(record.refresh_token.as_deref(), Some("r2"));
    }

    #[test]
    fn test_needs_refresh_within_margin() {
        let now = Utc::now();
        let mut record = CredentialRecord::from_grant(&grant("a", None, Some(600)), 3600, now);
        assert!(!record.needs_refresh(Duration::seconds(60), now));

        record.expires_at = now + Duration::seconds(30);
        assert!(record.needs_refresh(Duration::seconds(60), now));
        assert!(!record.is_expired(now));

        record.expires_at = now - Duration::seconds(1);
        assert!(record.is_expired(now));
    }

    #[test]
    fn test_oversized_expires_in_is_clamped() {
        let now = Utc::now();
        let ten_years = now + Duration::seconds(MAX_TOKEN_LIFETIME_SECS);

        for expires_in in [10_000_000_000_000, i64::MAX as u64 + 1, u64::MAX] {
            let at = grant("a", None, Some(expires_in)).expires_at(3600, now);
            assert_eq!(at, ten_years, "expires_in = {}", expires_in);
        }

        let record = CredentialRecord::from_grant(&grant("a", None, Some(u64::MAX)), 3600, now);
        assert!(!record.needs_refresh(Duration::seconds(60), now));
    }

    #[test]
    fn test_grant_deserializes_minimal_body() {
        let grant: TokenGrant = serde_json::from_str(r#"{"access_token":"abc"}"#).unwrap();
        assert_eq!(grant.access_token, "abc");
        assert!(grant.refresh_token.is_none());
        assert!(grant.expires_in.is_none());
    }

    #[test]
    fn test_record_json_preserves_all_fields() {
        let now = Utc::now();
        let record = CredentialRecord::from_grant(&grant("a", Some("r"), Some(10)), 3600, now);
        let json = serde_json::to_string(&record).unwrap();
        let back: CredentialRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_into_authorization() {
        let ok = TokenExchange::Granted(grant("a", Some("r"), Some(60))).into_authorization();
        assert_eq!(ok.unwrap().access_token, "a");

        let rejected = TokenExchange::Rejected {
            error: "invalid_grant".to_string(),
            description: Some("code already used".to_string()),
        }
        .into_authorization();
        assert_eq!(
            rejected.unwrap_err(),
            AuthError::AuthenticationError(
                "authorization rejected: invalid_grant - code already used".to_string()
            )
        );

        let transient = TokenExchange::Transient("timeout".to_string()).into_authorization();
        assert!(transient.unwrap_err().is_retryable());
    }

    #[test]
    fn test_token_prefix() {
        assert_eq!(token_prefix("abcdefghijklmnop"), "abcdefgh...");
        assert_eq!(token_prefix("abc"), "abc...");
    }
}
