use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::auth::MAX_TOKEN_LIFETIME_SECS;
use crate::store::StorageBackend;

pub const CONTA_AZUL: &str = "conta_azul";
pub const DIGISAC: &str = "digisac";

const DEFAULT_CONTA_AZUL_TOKEN_URL: &str = "https://auth.contaazul.com/oauth2/token";
const DEFAULT_CONTA_AZUL_AUTHORIZE_URL: &str = "https://auth.contaazul.com/oauth2/authorize";
const DEFAULT_CONTA_AZUL_SCOPE: &str = "openid profile aws.cognito.signin.user.admin";

/// Credential Manager - OAuth token lifecycle for external integrations
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value = "8000")]
    pub port: u16,

    /// API key protecting the admin endpoints
    #[arg(short = 'k', long, env = "ADMIN_API_KEY")]
    pub api_key: Option<String>,

    /// Credential storage backend (sqlite, json, memory)
    #[arg(short = 's', long, env = "STORAGE_BACKEND", default_value = "sqlite")]
    pub storage: String,

    /// SQLite database file, or token directory for the json backend
    #[arg(short = 'd', long, env = "STORAGE_PATH")]
    pub storage_path: Option<String>,

    /// Refresh tokens with less remaining lifetime than this (seconds)
    #[arg(long, env = "TOKEN_SAFETY_MARGIN", default_value = "60")]
    pub safety_margin: u64,

    /// Disable the background refresh worker
    #[arg(long, env = "DISABLE_REFRESH_WORKER", default_value = "false")]
    pub no_worker: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    /// HTTP max retries for authorized API calls
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3")]
    pub http_retries: u32,

    // Conta Azul (authorization code grant)
    #[arg(long, env = "CONTA_AZUL_CLIENT_ID", hide_env_values = true)]
    pub conta_azul_client_id: Option<String>,

    #[arg(long, env = "CONTA_AZUL_CLIENT_SECRET", hide_env_values = true)]
    pub conta_azul_client_secret: Option<String>,

    #[arg(long, env = "CONTA_AZUL_REDIRECT_URI")]
    pub conta_azul_redirect_uri: Option<String>,

    // Digisac (password grant)
    #[arg(long, env = "DIGISAC_BASE_URL")]
    pub digisac_base_url: Option<String>,

    #[arg(long, env = "DIGISAC_USER")]
    pub digisac_user: Option<String>,

    #[arg(long, env = "DIGISAC_PASSWORD", hide_env_values = true)]
    pub digisac_password: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Admin authentication
    pub admin_api_key: String,

    // Storage
    pub storage_backend: StorageBackend,
    pub storage_path: PathBuf,

    // Token lifecycle
    pub safety_margin: u64,
    pub default_token_lifetime: u64,
    pub token_request_timeout: u64,
    pub authorization_wait_timeout: u64,

    // Refresh worker
    pub worker_enabled: bool,
    pub worker_retry_interval: u64,
    pub worker_min_interval: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,
    pub http_base_delay_ms: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,

    // Integrations
    pub conta_azul: Option<ContaAzulConfig>,
    pub digisac: Option<DigisacConfig>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct ContaAzulConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub token_url: String,
    pub authorize_url: String,
    pub scope: String,
}

#[derive(Clone, Debug)]
pub struct DigisacConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
}

impl DigisacConfig {
    pub fn token_url(&self) -> String {
        format!("{}/oauth/token", self.base_url.trim_end_matches('/'))
    }
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    /// Build configuration from parsed arguments plus the environment-only tunables
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let storage_backend = parse_storage_backend(&args.storage)?;
        let storage_path = match args.storage_path {
            Some(path) => expand_tilde(&path),
            None => default_storage_path(&storage_backend),
        };

        let conta_azul = match (args.conta_azul_client_id, args.conta_azul_client_secret) {
            (Some(client_id), Some(client_secret)) => Some(ContaAzulConfig {
                client_id,
                client_secret,
                redirect_uri: args
                    .conta_azul_redirect_uri
                    .context("CONTA_AZUL_REDIRECT_URI is required when Conta Azul is configured")?,
                token_url: env_or("CONTA_AZUL_TOKEN_URL", DEFAULT_CONTA_AZUL_TOKEN_URL),
                authorize_url: env_or("CONTA_AZUL_AUTHORIZE_URL", DEFAULT_CONTA_AZUL_AUTHORIZE_URL),
                scope: env_or("CONTA_AZUL_SCOPE", DEFAULT_CONTA_AZUL_SCOPE),
            }),
            (None, None) => None,
            _ => anyhow::bail!(
                "CONTA_AZUL_CLIENT_ID and CONTA_AZUL_CLIENT_SECRET must be set together"
            ),
        };

        let digisac = match (args.digisac_base_url, args.digisac_user, args.digisac_password) {
            (Some(base_url), Some(username), Some(password)) => Some(DigisacConfig {
                base_url,
                username,
                password,
                client_id: env_or("DIGISAC_CLIENT_ID", "api"),
                client_secret: env_or("DIGISAC_CLIENT_SECRET", "secret"),
            }),
            (None, None, None) => None,
            _ => anyhow::bail!(
                "DIGISAC_BASE_URL, DIGISAC_USER and DIGISAC_PASSWORD must be set together"
            ),
        };

        let config = Config {
            server_host: args.host,
            server_port: args.port,

            admin_api_key: args
                .api_key
                .context("ADMIN_API_KEY is required (use -k or set ADMIN_API_KEY env var)")?,

            storage_backend,
            storage_path,

            safety_margin: args.safety_margin,
            default_token_lifetime: env_parse("DEFAULT_TOKEN_LIFETIME", 3600),
            token_request_timeout: env_parse("TOKEN_REQUEST_TIMEOUT", 60),
            authorization_wait_timeout: env_parse("AUTHORIZATION_WAIT_TIMEOUT", 300),

            worker_enabled: !args.no_worker,
            worker_retry_interval: env_parse("WORKER_RETRY_INTERVAL", 60),
            worker_min_interval: env_parse("WORKER_MIN_INTERVAL", 5),

            http_connect_timeout: env_parse("HTTP_CONNECT_TIMEOUT", 30),
            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,
            http_base_delay_ms: env_parse("HTTP_BASE_DELAY_MS", 1000),

            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),

            conta_azul,
            digisac,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.admin_api_key.trim().is_empty() {
            anyhow::bail!("ADMIN_API_KEY cannot be empty");
        }

        if self.conta_azul.is_none() && self.digisac.is_none() {
            anyhow::bail!(
                "No integration configured: set CONTA_AZUL_CLIENT_ID/CONTA_AZUL_CLIENT_SECRET \
                 or DIGISAC_BASE_URL/DIGISAC_USER/DIGISAC_PASSWORD"
            );
        }

        if self.default_token_lifetime > MAX_TOKEN_LIFETIME_SECS as u64 {
            anyhow::bail!(
                "DEFAULT_TOKEN_LIFETIME ({}s) cannot exceed {}s",
                self.default_token_lifetime,
                MAX_TOKEN_LIFETIME_SECS
            );
        }

        if self.safety_margin >= self.default_token_lifetime {
            anyhow::bail!(
                "TOKEN_SAFETY_MARGIN ({}s) must be shorter than DEFAULT_TOKEN_LIFETIME ({}s)",
                self.safety_margin,
                self.default_token_lifetime
            );
        }

        if self.worker_min_interval == 0 {
            anyhow::bail!("WORKER_MIN_INTERVAL must be at least 1 second");
        }

        Ok(())
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn default_storage_path(backend: &StorageBackend) -> PathBuf {
    let base = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("credential-manager");
    match backend {
        StorageBackend::Json => base.join("tokens"),
        _ => base.join("credentials.sqlite3"),
    }
}

fn parse_storage_backend(s: &str) -> Result<StorageBackend> {
    match s.to_lowercase().as_str() {
        "sqlite" => Ok(StorageBackend::Sqlite),
        "json" | "file" => Ok(StorageBackend::Json),
        "memory" => Ok(StorageBackend::Memory),
        other => anyhow::bail!("Unknown STORAGE_BACKEND: {} (expected sqlite, json or memory)", other),
    }
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<Config> {
        let mut argv = vec!["credential-manager", "-k", "admin-secret"];
        argv.extend_from_slice(extra);
        Config::from_args(CliArgs::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with('~'));

        assert_eq!(expand_tilde("/absolute/path"), PathBuf::from("/absolute/path"));
        assert_eq!(expand_tilde("relative/path"), PathBuf::from("relative/path"));
        assert_eq!(expand_tilde("~"), PathBuf::from("~"));
    }

    #[test]
    fn test_parse_storage_backend() {
        assert_eq!(parse_storage_backend("sqlite").unwrap(), StorageBackend::Sqlite);
        assert_eq!(parse_storage_backend("JSON").unwrap(), StorageBackend::Json);
        assert_eq!(parse_storage_backend("file").unwrap(), StorageBackend::Json);
        assert_eq!(parse_storage_backend("Memory").unwrap(), StorageBackend::Memory);
        assert!(parse_storage_backend("redis").is_err());
    }

    #[test]
    fn test_parse_log_format() {
        assert_eq!(parse_log_format("json"), LogFormat::Json);
        assert_eq!(parse_log_format("JSON"), LogFormat::Json);
        assert_eq!(parse_log_format("text"), LogFormat::Text);
        assert_eq!(parse_log_format(""), LogFormat::Text);
    }

    #[test]
    fn test_conta_azul_enabled_by_client_credentials() {
        let config = parse(&[
            "--conta-azul-client-id",
            "id",
            "--conta-azul-client-secret",
            "secret",
            "--conta-azul-redirect-uri",
            "https://example.com/integrations/conta_azul/callback",
        ])
        .unwrap();

        let conta_azul = config.conta_azul.as_ref().unwrap();
        assert_eq!(conta_azul.client_id, "id");
        assert!(conta_azul.token_url.starts_with("https://"));
        config.validate().unwrap();
    }

    #[test]
    fn test_conta_azul_requires_redirect_uri() {
        let err = parse(&[
            "--conta-azul-client-id",
            "id",
            "--conta-azul-client-secret",
            "secret",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("CONTA_AZUL_REDIRECT_URI"));
    }

    #[test]
    fn test_partial_digisac_config_is_rejected() {
        assert!(parse(&["--digisac-user", "bot"]).is_err());
    }

    #[test]
    fn test_digisac_token_url() {
        let config = parse(&[
            "--digisac-base-url",
            "https://acme.digisac.chat/api/v1/",
            "--digisac-user",
            "bot",
            "--digisac-password",
            "pw",
        ])
        .unwrap();
        assert_eq!(
            config.digisac.unwrap().token_url(),
            "https://acme.digisac.chat/api/v1/oauth/token"
        );
    }

    #[test]
    fn test_validate_rejects_margin_longer_than_lifetime() {
        let mut config = parse(&[
            "--digisac-base-url",
            "https://acme.digisac.chat/api/v1",
            "--digisac-user",
            "bot",
            "--digisac-password",
            "pw",
        ])
        .unwrap();
        config.safety_margin = config.default_token_lifetime;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_durations() {
        let mut config = parse(&[
            "--digisac-base-url",
            "https://acme.digisac.chat/api/v1",
            "--digisac-user",
            "bot",
            "--digisac-password",
            "pw",
        ])
        .unwrap();
        assert!(config.validate().is_ok());

        config.default_token_lifetime = u64::MAX;
        config.safety_margin = u64::MAX - 1;
        assert!(config.validate().is_err());
    }
}
