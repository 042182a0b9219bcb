//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use agora::error::AppError;
use agora::federation::{
    ACTOR_ID_HEADER, Credentials, FeedFetcher, PeerTransport, RemoteFeed, SERVER_ID_HEADER,
    parse_feed,
};
use agora::{AppState, config};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const FEED_URL: &str = "https://blog.example/rss";

const FEED_XML: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example Blog</title>
    <link>https://blog.example/</link>
    <item>
      <title>First</title>
      <link>https://blog.example/first</link>
      <description>one</description>
    </item>
    <item>
      <title>Second</title>
      <link>https://blog.example/second</link>
      <description>two</description>
    </item>
  </channel>
</rss>"#;

/// Peer network stand-in: known server keys and recorded deliveries
#[derive(Default)]
pub struct FakePeers {
    keys: Mutex<HashMap<String, String>>,
    pub delivered: Mutex<Vec<(String, Value)>>,
}

impl FakePeers {
    pub fn register(&self, domain: &str, public_key_pem: &str) {
        self.keys
            .lock()
            .unwrap()
            .insert(domain.to_string(), public_key_pem.to_string());
    }

    pub fn deliveries(&self) -> Vec<(String, Value)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTransport for FakePeers {
    async fn deliver(&self, domain: &str, payload: &Value) -> Result<String, AppError> {
        self.delivered
            .lock()
            .unwrap()
            .push((domain.to_string(), payload.clone()));
        Ok(r#"{"accepted":true}"#.to_string())
    }

    async fn fetch_server_key(&self, domain: &str) -> Result<String, AppError> {
        self.keys
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .ok_or_else(|| AppError::Federation(format!("unknown peer {}", domain)))
    }
}

/// Serves one canned RSS document for [`FEED_URL`]
pub struct StaticFeeds;

#[async_trait]
impl FeedFetcher for StaticFeeds {
    async fn fetch(&self, url: &str) -> Result<RemoteFeed, AppError> {
        if url != FEED_URL {
            return Err(AppError::Federation(format!("no feed at {}", url)));
        }
        parse_feed(url, "application/rss+xml", FEED_XML.as_bytes())
    }
}

/// A local user with the key it signs requests with
pub struct TestUser {
    pub id: String,
    pub private_key_pem: String,
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub peers: Arc<FakePeers>,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance for `a.example`
    pub async fn new() -> Self {
        Self::for_domain("a.example").await
    }

    pub async fn for_domain(domain: &str) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = Arc::new(config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: domain.to_string(),
                protocol: "https".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            admin: config::AdminConfig {
                username: "admin".to_string(),
                email: None,
            },
            identity: config::IdentityConfig {
                key_bits: 1024,
                max_clock_skew_secs: 300,
                peer_key_ttl_secs: 3600,
            },
            federation: config::FederationConfig {
                outbox_interval_secs: 5,
                inbox_interval_secs: 2,
                batch_size: 50,
                max_concurrent_requests: 4,
                lease_secs: 60,
                base_backoff_secs: 30,
                max_backoff_secs: 3600,
                connect_timeout_secs: 5,
                request_timeout_secs: 10,
                max_feed_bytes: 1024 * 1024,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        });

        let db = Arc::new(
            agora::data::Database::connect(&config.database.path)
                .await
                .unwrap(),
        );
        agora::ensure_server_identity(&db, &config).await.unwrap();

        let peers = Arc::new(FakePeers::default());
        let state = AppState::with_collaborators(config, db, peers.clone(), Arc::new(StaticFeeds));

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = agora::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            state,
            peers,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn domain(&self) -> &str {
        &self.state.config.server.domain
    }

    /// Register through the unauthenticated signup activity
    pub async fn signup(&self, username: &str) -> TestUser {
        let id = format!("@{}@{}", username, self.domain());
        let response = self
            .post_activity(
                None,
                json!({
                    "type": "Create",
                    "actorId": id,
                    "objectType": "User",
                    "object": {"username": username}
                }),
            )
            .await;
        assert_eq!(response.status(), 201, "signup for {} failed", username);

        let private_key_pem = self.state.db.private_key(&id).await.unwrap().unwrap();
        TestUser {
            id,
            private_key_pem,
        }
    }

    /// POST /activities, signed as `user` when given
    pub async fn post_activity(&self, user: Option<&TestUser>, body: Value) -> reqwest::Response {
        let mut request = self.client.post(self.url("/activities")).json(&body);
        if let Some(user) = user {
            request = sign_as(request, &user.id, &user.private_key_pem, ACTOR_ID_HEADER);
        }
        request.send().await.unwrap()
    }

    pub async fn get_activity(&self, user: Option<&TestUser>, id: &str) -> reqwest::Response {
        let mut request = self.client.get(self.url(&format!("/activities/{}", id)));
        if let Some(user) = user {
            request = sign_as(request, &user.id, &user.private_key_pem, ACTOR_ID_HEADER);
        }
        request.send().await.unwrap()
    }

    /// This server's private key, for signing as it towards another server
    pub async fn server_key(&self) -> String {
        self.state.db.private_key(self.domain()).await.unwrap().unwrap()
    }

    pub async fn server_public_key(&self) -> String {
        self.state.db.public_key(self.domain()).await.unwrap().unwrap()
    }

    /// POST /inbox signed as peer `from`
    pub async fn post_inbox(&self, from: &TestServer, body: Value) -> reqwest::Response {
        let key = from.server_key().await;
        let request = self.client.post(self.url("/inbox")).json(&body);
        sign_as(request, from.domain(), &key, SERVER_ID_HEADER)
            .send()
            .await
            .unwrap()
    }
}

pub fn sign_as(
    mut request: reqwest::RequestBuilder,
    id: &str,
    private_key_pem: &str,
    id_header: &'static str,
) -> reqwest::RequestBuilder {
    let credentials = Credentials::sign(id, private_key_pem, Utc::now()).unwrap();
    for (name, value) in credentials.headers(id_header) {
        request = request.header(name, value);
    }
    request
}
