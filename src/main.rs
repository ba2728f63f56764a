// =============================================================================
// Feed Hub — Main Entry Point
// =============================================================================
//
// Startup order: environment, config, logging, access token, feed transport,
// token refresh loop, HTTP API. Ctrl-C closes the transport, which joins
// every loop before the process exits.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use feedhub::api;
use feedhub::app_state::AppState;
use feedhub::auth::TokenProvider;
use feedhub::config::FeedConfig;

/// Refresh the access token this long before it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config_path = std::env::var("FEEDHUB_CONFIG").unwrap_or_else(|_| "feedhub.json".into());
    let loaded = FeedConfig::load(&config_path);
    let mut config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => FeedConfig::default(),
    };
    config.apply_env().context("invalid FEEDHUB_* environment")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    if let Err(e) = loaded {
        warn!(path = %config_path, error = %e, "Failed to load config, using defaults");
    }

    let hosts = config.hosts();
    info!(
        dev_circuit = config.dev_circuit,
        websocket = %hosts.websocket,
        data = %hosts.data,
        "Feed hub starting"
    );

    // ── 2. Access token ──────────────────────────────────────────────────
    if config.refresh_token.is_empty() {
        anyhow::bail!("FEEDHUB_REFRESH_TOKEN is not set");
    }
    let token = Arc::new(TokenProvider::new(
        hosts.authorization.clone(),
        config.refresh_token.clone(),
    )?);
    token
        .refresh()
        .await
        .context("initial access token refresh failed")?;

    // ── 3. Shared state & transport ──────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let token_check = Duration::from_secs(config.token_check_secs.max(1));
    let state = Arc::new(AppState::new(config, Arc::clone(&token))?);

    state
        .connection
        .start()
        .await
        .context("failed to connect to the feed")?;

    // ── 4. Token refresh loop ────────────────────────────────────────────
    let refresh_token = Arc::clone(&token);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(token_check);
        loop {
            interval.tick().await;
            if !refresh_token.needs_refresh(TOKEN_REFRESH_MARGIN) {
                continue;
            }
            match refresh_token.refresh().await {
                Ok(()) => info!(expires_at = ?refresh_token.expires_at(), "access token renewed"),
                Err(e) => error!(error = %e, "access token refresh failed"),
            }
        }
    });

    // ── 5. API server ────────────────────────────────────────────────────
    let app = api::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl+C");
            }
            warn!("Shutdown signal received, stopping gracefully");
        })
        .await
        .context("API server failed")?;

    state.connection.close().await?;
    info!("Feed hub shut down complete.");
    Ok(())
}
