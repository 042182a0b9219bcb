//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)
//!
//! The loaded `AppConfig` is immutable; components receive it (or the
//! section they need) at construction time.

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub admin: AdminConfig,
    pub identity: IdentityConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Base URL of a peer, using the same protocol as this instance.
    pub fn peer_base_url(&self, domain: &str) -> String {
        format!("{}://{}", self.protocol, domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Bootstrap administrator
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Admin username (default: "admin")
    #[serde(default = "default_admin_username")]
    pub username: String,
    /// Admin email
    pub email: Option<String>,
}

fn default_admin_username() -> String {
    "admin".to_string()
}

/// Key generation and request authentication
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// RSA modulus size for newly generated actor keys
    pub key_bits: usize,
    /// Accepted distance between a request timestamp and now, in seconds
    pub max_clock_skew_secs: i64,
    /// TTL for cached peer public keys, in seconds
    pub peer_key_ttl_secs: u64,
}

/// Delivery and inbox sweep settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Seconds between outbox sweeps
    pub outbox_interval_secs: u64,
    /// Seconds between inbox sweeps
    pub inbox_interval_secs: u64,
    /// Maximum items claimed per sweep
    pub batch_size: u32,
    /// Maximum concurrent peer requests within one sweep
    pub max_concurrent_requests: usize,
    /// How long a claimed item stays leased to a sweep
    pub lease_secs: i64,
    /// First retry delay after a failure
    pub base_backoff_secs: u64,
    /// Upper bound for retry delay
    pub max_backoff_secs: u64,
    /// TCP connect timeout for peer requests
    pub connect_timeout_secs: u64,
    /// Total timeout for peer requests
    pub request_timeout_secs: u64,
    /// Largest feed body read when following a URL
    pub max_feed_bytes: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (AGORA__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("server.domain", "localhost")?
            .set_default("database.path", "data/agora.db")?
            .set_default("admin.username", "admin")?
            .set_default("identity.key_bits", 2048)?
            .set_default("identity.max_clock_skew_secs", 300)?
            .set_default("identity.peer_key_ttl_secs", 3600)?
            .set_default("federation.outbox_interval_secs", 30)?
            .set_default("federation.inbox_interval_secs", 10)?
            .set_default("federation.batch_size", 50)?
            .set_default("federation.max_concurrent_requests", 10)?
            .set_default("federation.lease_secs", 120)?
            .set_default("federation.base_backoff_secs", 30)?
            .set_default("federation.max_backoff_secs", 21600)?
            .set_default("federation.connect_timeout_secs", 5)?
            .set_default("federation.request_timeout_secs", 20)?
            .set_default("federation.max_feed_bytes", 2 * 1024 * 1024)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("AGORA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Fully qualified id of a local user, e.g. `@alice@social.example.com`
    pub fn local_actor_id(&self, username: &str) -> String {
        format!("@{}@{}", username, self.server.domain)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        const MIN_KEY_BITS: usize = 1024;

        if self.server.domain.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "server.domain must not be empty".to_string(),
            ));
        }

        if self.identity.key_bits < MIN_KEY_BITS {
            return Err(crate::error::AppError::Config(format!(
                "identity.key_bits must be at least {}",
                MIN_KEY_BITS
            )));
        }

        if self.identity.max_clock_skew_secs <= 0 {
            return Err(crate::error::AppError::Config(
                "identity.max_clock_skew_secs must be greater than 0".to_string(),
            ));
        }

        if self.federation.batch_size == 0 || self.federation.max_concurrent_requests == 0 {
            return Err(crate::error::AppError::Config(
                "federation.batch_size and federation.max_concurrent_requests must be greater than 0"
                    .to_string(),
            ));
        }

        if self.federation.max_feed_bytes == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_feed_bytes must be greater than 0".to_string(),
            ));
        }

        if self.federation.lease_secs <= 0 {
            return Err(crate::error::AppError::Config(
                "federation.lease_secs must be greater than 0".to_string(),
            ));
        }

        if self.federation.base_backoff_secs > self.federation.max_backoff_secs {
            return Err(crate::error::AppError::Config(
                "federation.base_backoff_secs must not exceed federation.max_backoff_secs"
                    .to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            let host = normalized_server_host(&self.server.domain);
            tracing::warn!(
                host = %host,
                protocol = %self.server.protocol,
                "Running with a local server domain; peers will not be able to reach this instance"
            );
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}

#[cfg(test)]
pub(crate) fn test_config(domain: &str, db_path: PathBuf) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            domain: domain.to_string(),
            protocol: "https".to_string(),
        },
        database: DatabaseConfig { path: db_path },
        admin: AdminConfig {
            username: "admin".to_string(),
            email: None,
        },
        identity: IdentityConfig {
            key_bits: 1024,
            max_clock_skew_secs: 300,
            peer_key_ttl_secs: 3600,
        },
        federation: FederationConfig {
            outbox_interval_secs: 30,
            inbox_interval_secs: 10,
            batch_size: 50,
            max_concurrent_requests: 4,
            lease_secs: 120,
            base_backoff_secs: 30,
            max_backoff_secs: 3600,
            connect_timeout_secs: 5,
            request_timeout_secs: 20,
            max_feed_bytes: 64 * 1024,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}
