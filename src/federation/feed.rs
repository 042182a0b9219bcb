//! Remote feed retrieval
//!
//! `Follow` of an unknown URL fetches it through [`FeedFetcher`]. A JSON
//! response is read as a federation feed; anything else is handed to
//! `feed-rs` as RSS or Atom.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::data::FeedFormat;
use crate::error::AppError;
use crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS;

/// A fetched and parsed remote feed
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFeed {
    pub url: String,
    pub title: Option<String>,
    pub format: FeedFormat,
    /// Publishing actor, synthesized for RSS/Atom
    pub actor_id: String,
    pub items: Vec<RemoteItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteItem {
    /// Stable key within the feed: the item URL, or its id when it has none
    pub key: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub actor_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<RemoteFeed, AppError>;
}

/// reqwest-backed fetcher
pub struct HttpFeedFetcher {
    http_client: Arc<reqwest::Client>,
    max_bytes: usize,
}

impl HttpFeedFetcher {
    pub fn new(config: &AppConfig) -> Result<Self, AppError> {
        Ok(Self {
            http_client: Arc::new(super::delivery::build_http_client(config)?),
            max_bytes: config.federation.max_feed_bytes,
        })
    }

    /// Read the body chunk by chunk, giving up once it passes `max_bytes`
    async fn read_body(&self, url: &str, mut response: reqwest::Response) -> Result<Vec<u8>, AppError> {
        check_declared_length(url, response.content_length(), self.max_bytes)?;

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            append_capped(url, &mut body, &chunk, self.max_bytes)?;
        }
        Ok(body)
    }
}

fn check_declared_length(url: &str, declared: Option<u64>, max_bytes: usize) -> Result<(), AppError> {
    match declared {
        Some(len) if len > max_bytes as u64 => Err(AppError::Federation(format!(
            "Feed {} is too large: {} bytes (limit {})",
            url, len, max_bytes
        ))),
        _ => Ok(()),
    }
}

fn append_capped(url: &str, body: &mut Vec<u8>, chunk: &[u8], max_bytes: usize) -> Result<(), AppError> {
    if body.len() + chunk.len() > max_bytes {
        return Err(AppError::Federation(format!(
            "Feed {} exceeds {} bytes",
            url, max_bytes
        )));
    }
    body.extend_from_slice(chunk);
    Ok(())
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str) -> Result<RemoteFeed, AppError> {
        let started = Instant::now();
        let response = self
            .http_client
            .get(url)
            .header(
                "Accept",
                "application/json, application/rss+xml, application/atom+xml, text/xml;q=0.9",
            )
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch feed {}: {}", url, e)))?;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["feed"])
            .observe(started.elapsed().as_secs_f64());

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch feed {}: HTTP {}",
                url,
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = self.read_body(url, response).await?;

        parse_feed(url, &content_type, &body)
    }
}

/// Parse a fetched body according to its content type
pub fn parse_feed(url: &str, content_type: &str, body: &[u8]) -> Result<RemoteFeed, AppError> {
    let host = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .ok_or_else(|| AppError::Validation(format!("Invalid feed URL: {}", url)))?;

    if content_type.to_ascii_lowercase().contains("json") {
        parse_federation_json(url, &host, body)
    } else {
        parse_syndication(url, &host, body)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FederationFeed {
    #[serde(default, alias = "name")]
    title: Option<String>,
    #[serde(default)]
    actor_id: Option<String>,
    #[serde(default)]
    items: Vec<FederationItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FederationItem {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, alias = "name")]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    actor_id: Option<String>,
    #[serde(default, alias = "published")]
    created_at: Option<DateTime<Utc>>,
}

fn parse_federation_json(url: &str, host: &str, body: &[u8]) -> Result<RemoteFeed, AppError> {
    let feed: FederationFeed = serde_json::from_slice(body)
        .map_err(|e| AppError::Federation(format!("Invalid federation feed at {}: {}", url, e)))?;

    let actor_id = feed
        .actor_id
        .unwrap_or_else(|| format!("@feed@{}", host));

    let items = feed
        .items
        .into_iter()
        .filter_map(|item| {
            let key = item.url.clone().or_else(|| item.id.clone())?;
            Some(RemoteItem {
                key,
                url: item.url,
                title: item.title,
                content: item.content.map(|c| ammonia::clean(&c)),
                published_at: item.created_at,
                actor_id: item.actor_id.unwrap_or_else(|| actor_id.clone()),
            })
        })
        .collect();

    Ok(RemoteFeed {
        url: url.to_string(),
        title: feed.title,
        format: FeedFormat::Federation,
        actor_id,
        items,
    })
}

fn parse_syndication(url: &str, host: &str, body: &[u8]) -> Result<RemoteFeed, AppError> {
    let feed = feed_rs::parser::parse(body)
        .map_err(|e| AppError::Federation(format!("Unreadable feed at {}: {}", url, e)))?;

    let author = feed.authors.first().map(|person| person.name.as_str());
    let actor_id = synthesized_actor(author, host);

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|link| link.href.clone());
            let content = entry
                .content
                .and_then(|content| content.body)
                .or_else(|| entry.summary.map(|summary| summary.content))
                .map(|html| ammonia::clean(&html));
            RemoteItem {
                key: link.clone().unwrap_or_else(|| entry.id.clone()),
                url: link,
                title: entry.title.map(|t| t.content),
                content,
                published_at: entry.published.or(entry.updated),
                actor_id: entry
                    .authors
                    .first()
                    .map(|person| synthesized_actor(Some(&person.name), host))
                    .unwrap_or_else(|| actor_id.clone()),
            }
        })
        .collect();

    Ok(RemoteFeed {
        url: url.to_string(),
        title: feed.title.map(|t| t.content),
        format: FeedFormat::Syndication,
        actor_id,
        items,
    })
}

/// `@slug@host` for an RSS author
fn synthesized_actor(author: Option<&str>, host: &str) -> String {
    let slug: String = author
        .unwrap_or("")
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let slug = slug.trim_matches('_');
    let slug = if slug.is_empty() { "feed" } else { slug };
    format!("@{}@{}", slug, host)
}
