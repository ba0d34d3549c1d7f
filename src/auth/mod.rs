// Authentication module
// Manages the credential lifecycle for external API integrations

mod authorizer;
mod endpoint;
mod manager;
mod registry;
mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use authorizer::{
    AuthorizationCallback, AuthorizationCodeAuthorizer, CallbackDelivery, FullAuthorizer,
    PasswordAuthorizer,
};
pub use endpoint::{decode_token_response, ClientAuthMethod, OAuthTokenEndpoint, TokenEndpoint};
pub use manager::CredentialManager;
pub use registry::CredentialRegistry;
pub use types::{
    token_prefix, CredentialRecord, CredentialStatus, ManagerSettings, TokenExchange, TokenGrant,
    MAX_TOKEN_LIFETIME_SECS,
};
