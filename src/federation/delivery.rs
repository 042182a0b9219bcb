//! Peer transport
//!
//! Signed HTTP calls to other servers: activity pushes to `/inbox` and key
//! lookups on `/server`.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::identity::{Credentials, SERVER_ID_HEADER};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS;

/// Outbound calls to peer servers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// POST `payload` to the peer's inbox. Returns the response body.
    async fn deliver(&self, domain: &str, payload: &serde_json::Value) -> Result<String, AppError>;

    /// Fetch the peer's PEM public key from its `/server` document
    async fn fetch_server_key(&self, domain: &str) -> Result<String, AppError>;
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub item_id: String,
    pub domain: String,
    pub success: bool,
    pub response: Option<String>,
    pub error: Option<String>,
}

/// Server identity used to sign outgoing requests
#[derive(Clone)]
pub struct ServerSigner {
    pub domain: String,
    pub private_key_pem: String,
}

/// reqwest-backed transport with connect and request timeouts
#[derive(Clone)]
pub struct HttpTransport {
    http_client: Arc<reqwest::Client>,
    config: Arc<AppConfig>,
    signer: ServerSigner,
}

impl HttpTransport {
    pub fn new(config: Arc<AppConfig>, signer: ServerSigner) -> Result<Self, AppError> {
        let http_client = build_http_client(&config)?;
        Ok(Self {
            http_client: Arc::new(http_client),
            config,
            signer,
        })
    }

    fn inbox_url(&self, domain: &str) -> String {
        format!("{}/inbox", self.config.server.peer_base_url(domain))
    }

    fn server_url(&self, domain: &str) -> String {
        format!("{}/server", self.config.server.peer_base_url(domain))
    }
}

/// HTTP client for peer calls
pub fn build_http_client(config: &AppConfig) -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .user_agent(concat!("Agora/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(config.federation.connect_timeout_secs))
        .timeout(Duration::from_secs(config.federation.request_timeout_secs))
        .build()
        .map_err(|e| AppError::Internal(e.into()))
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn deliver(&self, domain: &str, payload: &serde_json::Value) -> Result<String, AppError> {
        let inbox_url = self.inbox_url(domain);
        let credentials =
            Credentials::sign(&self.signer.domain, &self.signer.private_key_pem, Utc::now())?;

        let mut request = self
            .http_client
            .post(&inbox_url)
            .header("Content-Type", "application/json")
            .json(payload);
        for (name, value) in credentials.headers(SERVER_ID_HEADER) {
            request = request.header(name, value);
        }

        let started = Instant::now();
        let response = request.send().await.map_err(|e| {
            AppError::Federation(format!("Failed to deliver to {}: {}", inbox_url, e))
        });
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .observe(started.elapsed().as_secs_f64());
        let response = response?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AppError::Federation(format!(
                "Inbox {} rejected activity: HTTP {} {}",
                inbox_url, status, body
            )));
        }

        tracing::debug!(domain = %domain, "Delivered activity");
        Ok(body)
    }

    async fn fetch_server_key(&self, domain: &str) -> Result<String, AppError> {
        let server_url = self.server_url(domain);
        let response = self
            .http_client
            .get(&server_url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch {}: {}", server_url, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch {}: HTTP {}",
                server_url,
                response.status()
            )));
        }

        let document: serde_json::Value = response.json().await.map_err(|e| {
            AppError::Federation(format!("Failed to parse server document: {}", e))
        })?;

        let advertised = document.get("domain").and_then(|v| v.as_str());
        if advertised.is_some_and(|d| !d.eq_ignore_ascii_case(domain)) {
            return Err(AppError::Federation(format!(
                "Server document for {} names a different domain",
                domain
            )));
        }

        document
            .get("publicKey")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AppError::Federation("Missing publicKey in server document".to_string()))
    }
}
