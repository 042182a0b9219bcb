//! Agora - activity processing and federation engine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - POST/GET /activities                                     │
//! │  - POST /inbox, GET /server                                 │
//! │  - /health, /metrics                                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Service + Activity Engine                     │
//! │  - Envelope validation, verb dispatch, audience             │
//! │  - Identity and signatures                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Data Layer + Federation Queues               │
//! │  - SQLite documents (sqlx)                                  │
//! │  - Outbox / inbox sweeps                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers and request authentication
//! - `activity`: envelope, dispatcher, verb handlers, audience
//! - `service`: glue between HTTP and the engine
//! - `federation`: keys, signatures, delivery, queues, feeds
//! - `data`: database layer
//! - `config`: configuration management
//! - `error`: error types

pub mod activity;
pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use serde_json::Map;
use std::sync::Arc;

use federation::{
    FeedFetcher, HttpFeedFetcher, HttpTransport, IdentityService, InboxWorker, KeyPair,
    OutboxWorker, PeerTransport, QueueSettings, ServerSigner, generate_keypair,
};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Request and content signature checks
    pub identity: Arc<IdentityService>,

    /// Activity submission and replay
    pub activities: Arc<service::ActivityService>,

    /// Outgoing peer requests
    pub transport: Arc<dyn PeerTransport>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Load or create this server's keypair
    /// 3. Build the HTTP transport and feed fetcher
    /// 4. Create the admin user if missing
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let config = Arc::new(config);
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        let server_key = ensure_server_identity(&db, &config).await?;
        let transport = Arc::new(HttpTransport::new(
            config.clone(),
            ServerSigner {
                domain: config.server.domain.clone(),
                private_key_pem: server_key.private_key_pem,
            },
        )?);
        let fetcher = Arc::new(HttpFeedFetcher::new(&config)?);

        let state = Self::with_collaborators(config, db, transport, fetcher);
        ensure_admin_user(&state.db, &state.config).await?;

        tracing::info!("Application state initialized successfully");
        Ok(state)
    }

    /// Assemble state around an existing database and peer-facing seams
    pub fn with_collaborators(
        config: Arc<config::AppConfig>,
        db: Arc<data::Database>,
        transport: Arc<dyn PeerTransport>,
        fetcher: Arc<dyn FeedFetcher>,
    ) -> Self {
        let identity = Arc::new(IdentityService::new(
            db.clone(),
            config.clone(),
            transport.clone(),
        ));
        let activities = Arc::new(service::ActivityService::new(
            db.clone(),
            config.clone(),
            identity.clone(),
            fetcher,
        ));
        Self {
            config,
            db,
            identity,
            activities,
            transport,
        }
    }

    pub fn outbox_worker(&self) -> OutboxWorker {
        OutboxWorker::new(
            self.db.clone(),
            self.transport.clone(),
            QueueSettings::from(&self.config.federation),
        )
    }

    pub fn inbox_worker(&self) -> InboxWorker {
        InboxWorker::new(
            self.db.clone(),
            self.activities.clone(),
            QueueSettings::from(&self.config.federation),
        )
    }
}

/// Load this server's keypair, generating it on first start
///
/// Stored with the domain as its id, next to the user keys.
pub async fn ensure_server_identity(
    db: &data::Database,
    config: &config::AppConfig,
) -> Result<KeyPair, error::AppError> {
    let domain = &config.server.domain;
    if let (Some(private_key_pem), Some(public_key_pem)) =
        (db.private_key(domain).await?, db.public_key(domain).await?)
    {
        return Ok(KeyPair {
            private_key_pem,
            public_key_pem,
        });
    }

    let keys = generate_keypair(config.identity.key_bits).await?;
    db.store_keys(domain, &keys.private_key_pem, &keys.public_key_pem)
        .await?;
    tracing::info!(domain = %domain, "Server keypair created");
    Ok(keys)
}

/// Ensure the configured admin user exists
async fn ensure_admin_user(
    db: &data::Database,
    config: &config::AppConfig,
) -> Result<(), error::AppError> {
    let admin_id = config.local_actor_id(&config.admin.username.trim().to_lowercase());
    if let Some(user) = db.find::<data::User>(&admin_id).await? {
        tracing::info!(user = %user.id, "Admin account exists");
        return Ok(());
    }

    tracing::info!("Creating admin account...");
    let keys = generate_keypair(config.identity.key_bits).await?;
    let mut tx = db.begin().await?;
    let user = activity::provision_user(
        &mut *tx,
        config,
        &config.admin.username,
        config.admin.email.as_deref(),
        Map::new(),
        true,
        &keys,
        chrono::Utc::now(),
    )
    .await?;
    tx.commit().await?;

    tracing::info!(user = %user.id, "Admin account created");
    Ok(())
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::activities_router())
        .merge(api::federation_router())
        .merge(api::metrics_router())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
