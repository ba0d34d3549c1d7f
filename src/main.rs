use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use credential_manager::auth::{
    AuthorizationCodeAuthorizer, ClientAuthMethod, CredentialManager, CredentialRegistry,
    FullAuthorizer, ManagerSettings, OAuthTokenEndpoint, PasswordAuthorizer,
};
use credential_manager::config::{self, Config, LogFormat};
use credential_manager::store::{self, CredentialStore};
use credential_manager::{routes, worker};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    init_tracing(&config);

    tracing::info!("🚀 Credential Manager starting...");
    tracing::info!(
        "Server configured: {}:{}",
        config.server_host,
        config.server_port
    );

    let store = store::open_store(&config.storage_backend, &config.storage_path)?;
    tracing::info!(
        "✅ Credential store ready ({:?} at {})",
        config.storage_backend,
        config.storage_path.display()
    );

    let registry = build_registry(&config, store)?;
    tracing::info!("✅ Registered integrations: {:?}", registry.integrations());

    // Background refresh, one worker per integration
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();
    if config.worker_enabled {
        for manager in registry.managers() {
            let worker = worker::RefreshWorker::new(
                manager,
                Duration::from_secs(config.worker_retry_interval),
                Duration::from_secs(config.worker_min_interval),
            );
            workers.push(worker.spawn(shutdown_rx.clone()));
        }
    } else {
        tracing::warn!("Refresh worker disabled; tokens are only renewed on demand");
    }

    let app_state = routes::AppState {
        admin_api_key: config.admin_api_key.clone(),
        registry,
    };
    let app = routes::router(app_state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    print_startup_banner(&config);
    tracing::info!("🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Workers only observe shutdown between iterations; an exchange already
    // running finishes on its own task.
    let _ = shutdown_tx.send(true);
    for handle in workers {
        if let Err(e) = handle.await {
            tracing::warn!("Refresh worker ended abnormally: {}", e);
        }
    }

    tracing::info!("👋 Server shutdown complete");

    Ok(())
}

fn init_tracing(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_current_span(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .init(),
    }
}

/// Build one credential manager per configured integration
fn build_registry(config: &Config, store: Arc<dyn CredentialStore>) -> Result<CredentialRegistry> {
    let registry = CredentialRegistry::new();
    let safety_margin = i64::try_from(config.safety_margin)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .context("TOKEN_SAFETY_MARGIN is out of range")?;
    let settings = ManagerSettings {
        safety_margin,
        default_lifetime: config.default_token_lifetime,
    };

    if let Some(ca) = &config.conta_azul {
        let endpoint = Arc::new(OAuthTokenEndpoint::new(
            &ca.token_url,
            &ca.client_id,
            &ca.client_secret,
            ClientAuthMethod::Basic,
            config.token_request_timeout,
        )?);
        let authorizer = AuthorizationCodeAuthorizer::new(
            endpoint.clone(),
            &ca.authorize_url,
            &ca.redirect_uri,
            Some(ca.scope.clone()),
            Duration::from_secs(config.authorization_wait_timeout),
        );
        registry.register_callback(config::CONTA_AZUL, authorizer.callback());

        registry.register(CredentialManager::new(
            config::CONTA_AZUL,
            settings.clone(),
            endpoint,
            store.clone(),
            Some(Arc::new(authorizer) as Arc<dyn FullAuthorizer>),
        )?);
    }

    if let Some(ds) = &config.digisac {
        let endpoint = Arc::new(OAuthTokenEndpoint::new(
            ds.token_url(),
            &ds.client_id,
            &ds.client_secret,
            ClientAuthMethod::RequestBody,
            config.token_request_timeout,
        )?);
        let authorizer = PasswordAuthorizer::new(endpoint.clone(), &ds.username, &ds.password);

        registry.register(CredentialManager::new(
            config::DIGISAC,
            settings,
            endpoint,
            store,
            Some(Arc::new(authorizer) as Arc<dyn FullAuthorizer>),
        )?);
    }

    Ok(registry)
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    let banner = r#"
╔═══════════════════════════════════════════════════════════╗
║                                                           ║
║               🔑 Credential Manager                       ║
║                                                           ║
║  OAuth token lifecycle for Conta Azul and Digisac         ║
║                                                           ║
╚═══════════════════════════════════════════════════════════╝
"#;

    println!("{}", banner);
    println!("  Version:       {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Server:        http://{}:{}",
        config.server_host, config.server_port
    );
    println!(
        "  Storage:       {:?} ({})",
        config.storage_backend,
        config.storage_path.display()
    );
    println!("  Safety margin: {}s", config.safety_margin);
    println!(
        "  Refresh worker: {}",
        if config.worker_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("  Log Level:     {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
