//! Entity document storage
//!
//! Every function takes a `&mut SqliteConnection` so the same code runs on a
//! pooled connection or inside a dispatch transaction (`&mut *tx`).

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeSet;

use super::models::{Document, Entity, EntityKind};
use crate::error::AppError;

fn decode_row(kind: &str, body: &str) -> Result<(EntityKind, serde_json::Value), AppError> {
    let kind = EntityKind::parse(kind).ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("unknown document kind in storage: {}", kind))
    })?;
    Ok((kind, serde_json::from_str(body)?))
}

/// Raw document body and its kind
pub async fn find_raw(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<(EntityKind, serde_json::Value)>, AppError> {
    let row = sqlx::query("SELECT kind, body FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(|row| {
        let kind: String = row.get("kind");
        let body: String = row.get("body");
        decode_row(&kind, &body)
    })
    .transpose()
}

/// Typed lookup; a document of another kind is treated as absent
pub async fn find<T: Document>(conn: &mut SqliteConnection, id: &str) -> Result<Option<T>, AppError> {
    match find_raw(conn, id).await? {
        Some((kind, body)) if T::accepts(kind) => Ok(Some(serde_json::from_value(body)?)),
        _ => Ok(None),
    }
}

pub async fn find_entity(conn: &mut SqliteConnection, id: &str) -> Result<Option<Entity>, AppError> {
    match find_raw(conn, id).await? {
        Some((kind, body)) => Ok(Some(Entity::from_json(kind, body)?)),
        None => Ok(None),
    }
}

pub async fn exists(conn: &mut SqliteConnection, id: &str) -> Result<bool, AppError> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

async fn write(
    conn: &mut SqliteConnection,
    sql: &str,
    id: &str,
    kind: EntityKind,
    owner: &str,
    body: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<u64, AppError> {
    let result = sqlx::query(sql)
        .bind(id)
        .bind(kind.as_str())
        .bind(owner)
        .bind(body.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

const INSERT_SQL: &str = "INSERT INTO documents (id, kind, actor_id, body, created_at, updated_at) \
     VALUES (?, ?, ?, ?, ?, ?)";

const INSERT_IGNORE_SQL: &str = "INSERT INTO documents (id, kind, actor_id, body, created_at, updated_at) \
     VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING";

const UPSERT_SQL: &str = "INSERT INTO documents (id, kind, actor_id, body, created_at, updated_at) \
     VALUES (?, ?, ?, ?, ?, ?) \
     ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, actor_id = excluded.actor_id, \
     body = excluded.body, updated_at = excluded.updated_at";

/// Insert a new document; fails if the id is taken
pub async fn insert<T: Document>(conn: &mut SqliteConnection, doc: &T) -> Result<(), AppError> {
    let body = serde_json::to_value(doc)?;
    write(conn, INSERT_SQL, doc.id(), doc.kind(), doc.owner(), body, Utc::now()).await?;
    Ok(())
}

/// Insert unless the id already exists. Returns true if inserted.
pub async fn insert_if_absent<T: Document>(
    conn: &mut SqliteConnection,
    doc: &T,
) -> Result<bool, AppError> {
    let body = serde_json::to_value(doc)?;
    let affected = write(
        conn,
        INSERT_IGNORE_SQL,
        doc.id(),
        doc.kind(),
        doc.owner(),
        body,
        Utc::now(),
    )
    .await?;
    Ok(affected > 0)
}

pub async fn save<T: Document>(conn: &mut SqliteConnection, doc: &T) -> Result<(), AppError> {
    let body = serde_json::to_value(doc)?;
    write(conn, UPSERT_SQL, doc.id(), doc.kind(), doc.owner(), body, Utc::now()).await?;
    Ok(())
}

pub async fn save_entity(conn: &mut SqliteConnection, entity: &Entity) -> Result<(), AppError> {
    let body = entity.to_json()?;
    write(
        conn,
        UPSERT_SQL,
        entity.id(),
        entity.kind(),
        entity.owner(),
        body,
        Utc::now(),
    )
    .await?;
    Ok(())
}

/// Physically remove a document. Only used for join records (reacts).
pub async fn remove(conn: &mut SqliteConnection, id: &str) -> Result<bool, AppError> {
    let result = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Ids of every live circle and group that lists `actor_id` as a member
pub async fn memberships(
    conn: &mut SqliteConnection,
    actor_id: &str,
) -> Result<BTreeSet<String>, AppError> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT d.id FROM documents d
        WHERE d.kind IN ('circle', 'group')
          AND COALESCE(json_extract(d.body, '$.lifecycle.state'), 'active') = 'active'
          AND EXISTS (
              SELECT 1 FROM json_each(d.body, '$.members') m
              WHERE json_extract(m.value, '$.id') = ?
          )
        "#,
    )
    .bind(actor_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(ids.into_iter().collect())
}

/// Live documents of `kind` owned by `actor_id`, oldest first
pub async fn list_by_owner<T: Document>(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    actor_id: &str,
) -> Result<Vec<T>, AppError> {
    let bodies: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT body FROM documents
        WHERE kind = ? AND actor_id = ?
          AND COALESCE(json_extract(body, '$.lifecycle.state'), 'active') = 'active'
        ORDER BY created_at ASC
        "#,
    )
    .bind(kind.as_str())
    .bind(actor_id)
    .fetch_all(&mut *conn)
    .await?;

    bodies
        .iter()
        .map(|body| serde_json::from_str(body).map_err(AppError::from))
        .collect()
}

pub async fn count_kind(conn: &mut SqliteConnection, kind: EntityKind) -> Result<i64, AppError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE kind = ?")
        .bind(kind.as_str())
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// Items of one feed, oldest first
pub async fn feed_items(
    conn: &mut SqliteConnection,
    feed_id: &str,
) -> Result<Vec<super::models::FeedItem>, AppError> {
    let bodies: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT body FROM documents
        WHERE kind = 'feeditem' AND json_extract(body, '$.feedId') = ?
        ORDER BY created_at ASC
        "#,
    )
    .bind(feed_id)
    .fetch_all(&mut *conn)
    .await?;

    bodies
        .iter()
        .map(|body| serde_json::from_str(body).map_err(AppError::from))
        .collect()
}
