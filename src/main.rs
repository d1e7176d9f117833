use std::fs;

use anyhow::{Context, anyhow};
use hushline::{AppState, app, auth, config::Config, platform::Platform};
use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")))
        .init();

    let config = Config::load()?;
    let platform = Platform::open(&config.database_url, config.presence_timeout).await?;
    let sweeper = platform.realtime.spawn_sweeper(config.sweep_interval);

    let clients = match &config.oauth_clients_path {
        Some(path) => {
            let json = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let clients = auth::Clients::from_json(serde_json::from_str(&json)?, &config.public_url)
                .map_err(|e| anyhow!("invalid OAuth clients in {}: {e:?}", path.display()))?;
            info!(providers = ?clients.providers(), "OAuth sign-in enabled");
            clients
        }
        None => {
            warn!("OAUTH_CLIENTS not set, only email sign-in is offered");
            auth::Clients::default()
        }
    };

    let settings = platform.identities.settings().await?;
    if settings.site_url != config.public_url {
        warn!(site_url = %settings.site_url, public_url = %config.public_url, "mailed links use the stored site url");
    }
    let session_ttl = time::Duration::seconds(settings.session_ttl_secs);

    let bind_addr = config.bind_addr.clone();
    let router = app(AppState::new(platform, clients, config), session_ttl);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("listening on {bind_addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
