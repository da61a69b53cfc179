use notify_auth::{
    build_router,
    config::AuthConfig,
    services::{
        spawn_jwt_settings_reload, spawn_session_sweep, EmailProvider, JwtSettingsReloader,
        MockEmailService, NotificationClient, PgCredentialStore, ServiceError,
    },
    utils::SecretHasher,
    AppState,
};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

const PROVIDER_CHANGE_BUFFER: usize = 64;
const OUTBOUND_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = AuthConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;

    tracing::info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.environment,
        "Starting authentication service"
    );
    for setting in config.unsafe_defaults() {
        tracing::error!(setting = setting, "Insecure built-in default in use");
    }

    let store = PgCredentialStore::connect(&config.database.url, config.database.max_connections)
        .await
        .map_err(ServiceError::from)?;
    store.run_migrations().await.map_err(ServiceError::from)?;

    let email: Arc<dyn EmailProvider> = match &config.notification_service_url {
        Some(url) => Arc::new(NotificationClient::new(url)?),
        None => {
            tracing::warn!("NOTIFICATION_SERVICE_URL not set; emails are only logged");
            Arc::new(MockEmailService::new())
        }
    };

    let http = reqwest::Client::builder()
        .timeout(OUTBOUND_HTTP_TIMEOUT)
        .build()
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("HTTP client: {}", e)))?;

    let state = AppState::new(
        config.clone(),
        Arc::new(store.clone()),
        email,
        Arc::new(SecretHasher::default()),
        http,
    );

    // Provider edits arrive over LISTEN/NOTIFY; the periodic resync covers
    // anything the listener misses.
    let (changes_tx, changes_rx) = mpsc::channel(PROVIDER_CHANGE_BUFFER);
    let _listener = match store.listen_provider_changes(changes_tx.clone()).await {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Provider change listener unavailable; relying on resync");
            None
        }
    };
    let _registry = state.providers.clone().start(
        Duration::from_secs(config.providers.startup_delay_seconds),
        Duration::from_secs(config.providers.resync_seconds),
        changes_rx,
    );
    let _sweep = spawn_session_sweep(state.sessions.clone());
    let _jwt_reload = spawn_jwt_settings_reload(
        Arc::new(JwtSettingsReloader::new(
            state.store.clone(),
            state.issuer.clone(),
            config.jwt.clone(),
        )),
        Duration::from_secs(config.settings_reload_seconds),
    );

    let app = build_router(state);

    let addr: SocketAddr = config.common.bind_address().parse().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("Invalid bind address: {}", e))
    })?;
    tracing::info!(address = %addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Keeps the registry watcher alive for the life of the server.
    drop(changes_tx);
    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
