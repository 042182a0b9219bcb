//! SQLite database operations
//!
//! All database access goes through this module and `documents`.
//! Functions that must also run inside a dispatch transaction take a
//! `&mut SqliteConnection`; the rest are methods on [`Database`].

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::BTreeSet;
use std::path::Path;

use super::documents;
use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper
pub struct Database {
    pool: Pool<Sqlite>,
}

/// Queue depth snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub outbox_pending: i64,
    pub outbox_error: i64,
    pub inbox_pending: i64,
}

impl Database {
    /// Connect to the SQLite file at `path`, creating it if needed, and run
    /// migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database migrations applied");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction. Dropping it without `commit` rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, AppError> {
        Ok(self.pool.begin().await?)
    }

    // =========================================================================
    // Documents
    // =========================================================================

    pub async fn find<T: Document>(&self, id: &str) -> Result<Option<T>, AppError> {
        let mut conn = self.pool.acquire().await?;
        documents::find(&mut conn, id).await
    }

    pub async fn find_entity(&self, id: &str) -> Result<Option<Entity>, AppError> {
        let mut conn = self.pool.acquire().await?;
        documents::find_entity(&mut conn, id).await
    }

    /// Circle and group ids the actor belongs to, read in one query
    pub async fn memberships(&self, actor_id: &str) -> Result<BTreeSet<String>, AppError> {
        let mut conn = self.pool.acquire().await?;
        documents::memberships(&mut conn, actor_id).await
    }

    pub async fn save<T: Document>(&self, doc: &T) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        documents::save(&mut conn, doc).await
    }

    pub async fn feed_items(&self, feed_id: &str) -> Result<Vec<FeedItem>, AppError> {
        let mut conn = self.pool.acquire().await?;
        documents::feed_items(&mut conn, feed_id).await
    }

    pub async fn count_documents(&self, kind: EntityKind) -> Result<i64, AppError> {
        let mut conn = self.pool.acquire().await?;
        documents::count_kind(&mut conn, kind).await
    }

    // =========================================================================
    // Actor keys
    // =========================================================================

    /// PEM private key of a local actor (user or this server)
    pub async fn private_key(&self, actor_id: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.pool.acquire().await?;
        private_key(&mut conn, actor_id).await
    }

    pub async fn public_key(&self, actor_id: &str) -> Result<Option<String>, AppError> {
        let key = sqlx::query_scalar("SELECT public_key_pem FROM actor_keys WHERE actor_id = ?")
            .bind(actor_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(key)
    }

    pub async fn store_keys(
        &self,
        actor_id: &str,
        private_key_pem: &str,
        public_key_pem: &str,
    ) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        store_keys(&mut conn, actor_id, private_key_pem, public_key_pem).await
    }

    // =========================================================================
    // Servers
    // =========================================================================

    pub async fn get_server(&self, domain: &str) -> Result<Option<Server>, AppError> {
        let server = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(server)
    }

    /// Record a peer's key on contact
    pub async fn upsert_server_key(&self, domain: &str, public_key: &str) -> Result<(), AppError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO servers (domain, public_key, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(domain) DO UPDATE SET public_key = excluded.public_key,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(domain)
        .bind(public_key)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_delivery_success(&self, domain: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE servers SET error_count = 0, backoff_secs = 0, next_poll_at = NULL,
                updated_at = ?
            WHERE domain = ?
            "#,
        )
        .bind(Utc::now())
        .bind(domain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_delivery_failure(
        &self,
        domain: &str,
        backoff_secs: i64,
        next_poll_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE servers SET error_count = error_count + 1, backoff_secs = ?,
                next_poll_at = ?, updated_at = ?
            WHERE domain = ?
            "#,
        )
        .bind(backoff_secs)
        .bind(next_poll_at)
        .bind(Utc::now())
        .bind(domain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Outbox
    // =========================================================================

    /// Lease up to `limit` due items (pending or error) until `lease_until`
    ///
    /// The select and the lease are one statement, so concurrent sweeps never
    /// receive the same item while its lease is live.
    pub async fn claim_outbox(
        &self,
        limit: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxItem>, AppError> {
        let items = sqlx::query_as::<_, OutboxItem>(
            r#"
            UPDATE outbox SET lease_expires_at = ?1
            WHERE id IN (
                SELECT id FROM outbox
                WHERE status IN ('pending', 'error')
                  AND next_attempt_at <= ?2
                  AND (lease_expires_at IS NULL OR lease_expires_at <= ?2)
                ORDER BY next_attempt_at ASC
                LIMIT ?3
            )
            RETURNING *
            "#,
        )
        .bind(lease_until)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn mark_outbox_delivered(
        &self,
        id: &str,
        response: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE outbox SET status = 'delivered', response = ?, error = NULL,
                delivered_at = ?, last_attempted_at = ?, attempts = attempts + 1,
                lease_expires_at = NULL
            WHERE id = ? AND status != 'delivered'
            "#,
        )
        .bind(response)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_outbox_failed(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE outbox SET status = 'error', error = ?, last_attempted_at = ?,
                attempts = attempts + 1, next_attempt_at = ?, lease_expires_at = NULL
            WHERE id = ? AND status != 'delivered'
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(next_attempt_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_outbox_item(&self, id: &str) -> Result<Option<OutboxItem>, AppError> {
        let item = sqlx::query_as::<_, OutboxItem>("SELECT * FROM outbox WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    pub async fn outbox_for_activity(&self, activity_id: &str) -> Result<Vec<OutboxItem>, AppError> {
        let items = sqlx::query_as::<_, OutboxItem>(
            "SELECT * FROM outbox WHERE activity_id = ? ORDER BY domain ASC",
        )
        .bind(activity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    // =========================================================================
    // Inbox
    // =========================================================================

    /// Store a peer-submitted activity as pending
    pub async fn enqueue_inbox(
        &self,
        server_domain: &str,
        payload: &serde_json::Value,
    ) -> Result<String, AppError> {
        let id = EntityId::new().0;
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO inbox (id, server_domain, payload, status, next_attempt_at, created_at)
            VALUES (?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(server_domain)
        .bind(payload.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn claim_inbox(
        &self,
        limit: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<InboxItem>, AppError> {
        let items = sqlx::query_as::<_, InboxItem>(
            r#"
            UPDATE inbox SET lease_expires_at = ?1
            WHERE id IN (
                SELECT id FROM inbox
                WHERE status = 'pending'
                  AND next_attempt_at <= ?2
                  AND (lease_expires_at IS NULL OR lease_expires_at <= ?2)
                ORDER BY created_at ASC
                LIMIT ?3
            )
            RETURNING *
            "#,
        )
        .bind(lease_until)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn mark_inbox_completed(&self, id: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE inbox SET status = 'completed', error = NULL, processed_at = ?,
                last_attempted_at = ?, attempts = attempts + 1, lease_expires_at = NULL
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt; the item stays pending
    pub async fn mark_inbox_failed(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE inbox SET error = ?, last_attempted_at = ?, attempts = attempts + 1,
                next_attempt_at = ?, lease_expires_at = NULL
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(next_attempt_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_inbox_item(&self, id: &str) -> Result<Option<InboxItem>, AppError> {
        let item = sqlx::query_as::<_, InboxItem>("SELECT * FROM inbox WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    pub async fn queue_depth(&self) -> Result<QueueDepth, AppError> {
        let (outbox_pending, outbox_error): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0)
            FROM outbox
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let inbox_pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM inbox WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;

        Ok(QueueDepth {
            outbox_pending,
            outbox_error,
            inbox_pending,
        })
    }
}

// =============================================================================
// Connection-level helpers used inside dispatch transactions
// =============================================================================

pub async fn private_key(
    conn: &mut SqliteConnection,
    actor_id: &str,
) -> Result<Option<String>, AppError> {
    let key = sqlx::query_scalar("SELECT private_key_pem FROM actor_keys WHERE actor_id = ?")
        .bind(actor_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(key)
}

pub async fn store_keys(
    conn: &mut SqliteConnection,
    actor_id: &str,
    private_key_pem: &str,
    public_key_pem: &str,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO actor_keys (actor_id, private_key_pem, public_key_pem, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(actor_id)
    .bind(private_key_pem)
    .bind(public_key_pem)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Queue `payload` for `domain`. One item per (activity, domain).
pub async fn enqueue_outbox(
    conn: &mut SqliteConnection,
    activity_id: &str,
    domain: &str,
    payload: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        r#"
        INSERT INTO outbox (id, activity_id, domain, payload, status, next_attempt_at, created_at)
        VALUES (?, ?, ?, ?, 'pending', ?, ?)
        ON CONFLICT(activity_id, domain) DO NOTHING
        "#,
    )
    .bind(EntityId::new().0)
    .bind(activity_id)
    .bind(domain)
    .bind(payload.to_string())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() > 0 {
        touch_server(conn, domain, now).await?;
        sqlx::query("UPDATE servers SET reference_count = reference_count + 1 WHERE domain = ?")
            .bind(domain)
            .execute(&mut *conn)
            .await?;
    }

    Ok(result.rows_affected() > 0)
}

/// Make sure a row exists for `domain`
pub async fn touch_server(
    conn: &mut SqliteConnection,
    domain: &str,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO servers (domain, created_at, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(domain) DO NOTHING
        "#,
    )
    .bind(domain)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Adjust how many local actors follow someone on `domain`
pub async fn adjust_follower_count(
    conn: &mut SqliteConnection,
    domain: &str,
    delta: i64,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    touch_server(conn, domain, now).await?;
    sqlx::query(
        r#"
        UPDATE servers SET follower_count = MAX(follower_count + ?, 0), updated_at = ?
        WHERE domain = ?
        "#,
    )
    .bind(delta)
    .bind(now)
    .bind(domain)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
