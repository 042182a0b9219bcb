//! Federation queues
//!
//! Outbox: one item per (activity, destination domain), written in the same
//! transaction as the activity. A periodic sweep leases due items, pushes
//! them to peers concurrently and records the outcome.
//!
//! Inbox: activities received from peers, stored as pending and replayed
//! through the dispatcher by a second sweep.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::SqliteConnection;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::delivery::{DeliveryResult, PeerTransport};
use crate::config::FederationConfig;
use crate::data::{
    self, Activity, Database, Entity, InboxItem, OutboxItem, PUBLIC, SERVER, documents, domain_of,
    is_local_id,
};
use crate::error::AppError;
use crate::metrics::{INBOX_PROCESSED, OUTBOX_DELIVERIES, QUEUE_DEPTH};

/// Sweep settings shared by both queues
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub batch_size: u32,
    pub max_concurrent: usize,
    pub lease: chrono::Duration,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl From<&FederationConfig> for QueueSettings {
    fn from(config: &FederationConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_concurrent: config.max_concurrent_requests,
            lease: chrono::Duration::seconds(config.lease_secs),
            base_backoff_secs: config.base_backoff_secs,
            max_backoff_secs: config.max_backoff_secs,
        }
    }
}

/// Retry delay for the given attempt number (1-based), with up to a second
/// of jitter
pub fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let secs = base_secs.saturating_mul(1u64 << pow).min(max_secs);
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}

fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

/// Summary of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

// =============================================================================
// Outbox planning
// =============================================================================

/// Peer domains that must receive an activity addressed to `recipients`
///
/// Local circles and groups are expanded to their members; special
/// recipients and local actors need no delivery.
pub async fn destination_domains(
    conn: &mut SqliteConnection,
    recipients: &BTreeSet<&str>,
    local_domain: &str,
) -> Result<BTreeSet<String>, AppError> {
    let mut domains = BTreeSet::new();
    let add_remote = |id: &str, domains: &mut BTreeSet<String>| {
        if let Some(domain) = domain_of(id) {
            if !domain.eq_ignore_ascii_case(local_domain) {
                domains.insert(domain.to_ascii_lowercase());
            }
        }
    };

    for recipient in recipients {
        if *recipient == PUBLIC || *recipient == SERVER {
            continue;
        }

        if !is_local_id(recipient, local_domain) {
            add_remote(recipient, &mut domains);
            continue;
        }

        let members = match documents::find_entity(conn, recipient).await? {
            Some(Entity::Circle(circle)) if !circle.lifecycle.is_deleted() => circle.members,
            Some(Entity::Group(group)) if !group.lifecycle.is_deleted() => group.members,
            _ => continue,
        };
        for member in &members {
            add_remote(&member.id, &mut domains);
        }
    }

    Ok(domains)
}

/// Queue `activity` for every peer domain among its recipients
///
/// Runs on the dispatch transaction. Blind recipients are only sent to the
/// domain they live on.
pub async fn enqueue_activity(
    conn: &mut SqliteConnection,
    activity: &Activity,
    local_domain: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>, AppError> {
    let recipients = activity.addressing.recipients();
    let domains = destination_domains(conn, &recipients, local_domain).await?;

    let mut queued = Vec::with_capacity(domains.len());
    for domain in domains {
        let mut scoped = activity.clone();
        scoped.map_addressing(|addressing| addressing.for_domain(&domain));
        let payload = serde_json::json!({ "activity": scoped });
        if data::enqueue_outbox(conn, &activity.id, &domain, &payload, now).await? {
            queued.push(domain);
        }
    }

    if !queued.is_empty() {
        tracing::debug!(activity = %activity.id, domains = ?queued, "Queued activity for delivery");
    }
    Ok(queued)
}

// =============================================================================
// Outbox sweep
// =============================================================================

/// Delivers due outbox items
pub struct OutboxWorker {
    db: Arc<Database>,
    transport: Arc<dyn PeerTransport>,
    settings: QueueSettings,
}

impl OutboxWorker {
    pub fn new(db: Arc<Database>, transport: Arc<dyn PeerTransport>, settings: QueueSettings) -> Self {
        Self {
            db,
            transport,
            settings,
        }
    }

    /// Claim one batch and deliver it
    pub async fn sweep(&self) -> Result<SweepReport, AppError> {
        let now = Utc::now();
        let items = self
            .db
            .claim_outbox(self.settings.batch_size, now, now + self.settings.lease)
            .await?;

        if items.is_empty() {
            self.refresh_depth().await;
            return Ok(SweepReport::default());
        }

        tracing::info!(count = items.len(), "Delivering outbox batch");

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent));
        let mut tasks = Vec::with_capacity(items.len());

        for item in items {
            let semaphore = semaphore.clone();
            let transport = self.transport.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                deliver_one(transport.as_ref(), item).await
            }));
        }

        let mut report = SweepReport::default();
        let mut attempts = Vec::new();
        for task in tasks {
            match task.await {
                Ok(attempt) => attempts.push(attempt),
                Err(e) => tracing::error!(error = %e, "Delivery task panicked"),
            }
        }

        for (item, result) in attempts {
            report.claimed += 1;
            if let Err(e) = self.record(&item, &result).await {
                tracing::error!(item = %item.id, error = %e, "Failed to record delivery outcome");
            }
            if result.success {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        tracing::info!(
            "Outbox sweep complete: {} delivered, {} failed",
            report.succeeded,
            report.failed
        );

        self.refresh_depth().await;
        Ok(report)
    }

    async fn record(&self, item: &OutboxItem, result: &DeliveryResult) -> Result<(), AppError> {
        let now = Utc::now();
        if result.success {
            OUTBOX_DELIVERIES.with_label_values(&["delivered"]).inc();
            self.db
                .mark_outbox_delivered(&item.id, result.response.as_deref().unwrap_or(""), now)
                .await?;
            self.db.record_delivery_success(&item.domain).await?;
        } else {
            OUTBOX_DELIVERIES.with_label_values(&["error"]).inc();
            let attempt = u32::try_from(item.attempts + 1).unwrap_or(u32::MAX);
            let delay = next_backoff(
                attempt,
                self.settings.base_backoff_secs,
                self.settings.max_backoff_secs,
            );
            let next = retry_at(now, delay);
            let error = result.error.as_deref().unwrap_or("delivery failed");

            tracing::warn!(
                item = %item.id,
                domain = %item.domain,
                attempt,
                retry_in_secs = delay.as_secs(),
                error = %error,
                "Delivery failed"
            );

            self.db.mark_outbox_failed(&item.id, error, now, next).await?;
            self.db
                .record_delivery_failure(&item.domain, delay.as_secs() as i64, next)
                .await?;
        }
        Ok(())
    }

    async fn refresh_depth(&self) {
        if let Ok(depth) = self.db.queue_depth().await {
            QUEUE_DEPTH
                .with_label_values(&["outbox_pending"])
                .set(depth.outbox_pending);
            QUEUE_DEPTH
                .with_label_values(&["outbox_error"])
                .set(depth.outbox_error);
            QUEUE_DEPTH
                .with_label_values(&["inbox_pending"])
                .set(depth.inbox_pending);
        }
    }
}

async fn deliver_one(transport: &dyn PeerTransport, item: OutboxItem) -> (OutboxItem, DeliveryResult) {
    let outcome = transport.deliver(&item.domain, &item.payload.0).await;
    let result = DeliveryResult {
        item_id: item.id.clone(),
        domain: item.domain.clone(),
        success: outcome.is_ok(),
        response: outcome.as_ref().ok().cloned(),
        error: outcome.err().map(|e| e.to_string()),
    };
    (item, result)
}

// =============================================================================
// Inbox sweep
// =============================================================================

/// Runs a peer-submitted activity through local dispatch
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InboundProcessor: Send + Sync {
    async fn process(&self, server_domain: &str, payload: &serde_json::Value) -> Result<(), AppError>;
}

/// Processes pending inbox items
pub struct InboxWorker {
    db: Arc<Database>,
    processor: Arc<dyn InboundProcessor>,
    settings: QueueSettings,
}

impl InboxWorker {
    pub fn new(
        db: Arc<Database>,
        processor: Arc<dyn InboundProcessor>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            db,
            processor,
            settings,
        }
    }

    /// Claim one batch and dispatch it
    ///
    /// Items are processed in arrival order, one at a time, since they may
    /// depend on each other (a Create followed by an Update).
    pub async fn sweep(&self) -> Result<SweepReport, AppError> {
        let now = Utc::now();
        let items = self
            .db
            .claim_inbox(self.settings.batch_size, now, now + self.settings.lease)
            .await?;

        let mut report = SweepReport::default();
        for item in items {
            report.claimed += 1;
            match self.processor.process(&item.server_domain, &item.payload.0).await {
                Ok(()) => {
                    INBOX_PROCESSED.with_label_values(&["completed"]).inc();
                    self.db.mark_inbox_completed(&item.id, Utc::now()).await?;
                    report.succeeded += 1;
                }
                Err(e) => {
                    INBOX_PROCESSED.with_label_values(&["error"]).inc();
                    self.record_failure(&item, &e).await?;
                    report.failed += 1;
                }
            }
        }

        if report.claimed > 0 {
            tracing::info!(
                "Inbox sweep complete: {} completed, {} failed",
                report.succeeded,
                report.failed
            );
        }
        Ok(report)
    }

    async fn record_failure(&self, item: &InboxItem, error: &AppError) -> Result<(), AppError> {
        let now = Utc::now();
        let attempt = u32::try_from(item.attempts + 1).unwrap_or(u32::MAX);
        let delay = next_backoff(
            attempt,
            self.settings.base_backoff_secs,
            self.settings.max_backoff_secs,
        );
        tracing::warn!(
            item = %item.id,
            server = %item.server_domain,
            attempt,
            error = %error,
            "Inbox item failed; will retry"
        );
        self.db
            .mark_inbox_failed(&item.id, &error.to_string(), now, retry_at(now, delay))
            .await
    }
}
