//! Peer Key Caching
//!
//! Caches peer server public keys to reduce `/server` fetches.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::AppError;

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    /// PEM-encoded public key
    pem: String,
    /// When this entry was cached
    cached_at: Instant,
    ttl: Duration,
}

impl CachedKey {
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Public key cache
///
/// Thread-safe cache keyed by peer domain. The fetch strategy is supplied by
/// the caller so the cache stays independent of the transport.
pub struct PublicKeyCache {
    cache: Arc<RwLock<HashMap<String, CachedKey>>>,
    default_ttl: Duration,
}

impl PublicKeyCache {
    /// Create new public key cache
    ///
    /// # Arguments
    /// * `default_ttl` - TTL for cached keys (default: 1 hour)
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            default_ttl: default_ttl.unwrap_or(Duration::from_secs(3600)),
        }
    }

    /// Get the key for `domain`, calling `fetch` on a miss or expiry
    pub async fn get_or_fetch<F, Fut>(&self, domain: &str, fetch: F) -> Result<String, AppError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<String, AppError>>,
    {
        // 1. Check cache (read lock)
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(domain) {
                if cached.is_valid() {
                    tracing::debug!("Peer key cache hit for {}", domain);
                    return Ok(cached.pem.clone());
                }
                tracing::debug!("Peer key cache expired for {}", domain);
            }
        }

        // 2. Cache miss or expired - fetch from the peer
        tracing::debug!("Peer key cache miss for {}, fetching...", domain);
        let pem = fetch(domain.to_string()).await?;

        // 3. Update cache (write lock)
        {
            let mut cache = self.cache.write().await;
            cache.insert(
                domain.to_string(),
                CachedKey {
                    pem: pem.clone(),
                    cached_at: Instant::now(),
                    ttl: self.default_ttl,
                },
            );
        }

        Ok(pem)
    }

    /// Invalidate a cached key, e.g. after it failed verification
    pub async fn invalidate(&self, domain: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(domain);
        tracing::debug!("Invalidated peer key cache for {}", domain);
    }

    /// Prune expired entries
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| v.is_valid());
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!("Pruned {} expired peer key cache entries", removed);
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.cache.read().await.len()
    }
}
