//! Agora binary entry point

use agora::{AppState, config};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize AppState
/// 4. Build Axum router
/// 5. Start background sweeps
/// 6. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    let default_filter = format!("agora={},tower_http=debug", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.clone().into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.clone().into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Starting Agora..."
    );

    agora::metrics::init_metrics();

    // 3. Initialize application state
    let state = AppState::new(config.clone()).await?;

    // 4. Build Axum router
    let app = agora::build_router(state.clone());

    // 5. Start background sweeps
    spawn_outbox_task(state.clone());
    spawn_inbox_task(state.clone());
    spawn_key_pruning_task(state.clone());

    // 6. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}

/// Deliver queued activities to peers
fn spawn_outbox_task(state: AppState) {
    let worker = state.outbox_worker();
    let period = Duration::from_secs(state.config.federation.outbox_interval_secs.max(1));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(error) = worker.sweep().await {
                tracing::error!(%error, "Outbox sweep failed");
            }
        }
    });

    tracing::info!("Outbox task spawned");
}

/// Apply activities received from peers
fn spawn_inbox_task(state: AppState) {
    let worker = state.inbox_worker();
    let period = Duration::from_secs(state.config.federation.inbox_interval_secs.max(1));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(error) = worker.sweep().await {
                tracing::error!(%error, "Inbox sweep failed");
            }
        }
    });

    tracing::info!("Inbox task spawned");
}

fn spawn_key_pruning_task(state: AppState) {
    let period = Duration::from_secs(state.config.identity.peer_key_ttl_secs.max(60));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // first tick fires immediately; nothing is cached yet
        interval.tick().await;
        loop {
            interval.tick().await;
            state.identity.prune_peer_keys().await;
        }
    });
}
