//! Create
//!
//! The new object always belongs to the activity's actor. Local objects get
//! a fresh id and a provenance signature; relayed objects keep the id their
//! home server gave them, so a redelivery is a no-op.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use sqlx::SqliteConnection;

use super::{HandlerContext, Prepared};
use crate::config::AppConfig;
use crate::data::{
    self, ADDRESSING_FIELDS, Activity, Addressing, Circle, ContentKind, ContentObject, Document,
    Entity, EntityId, Lifecycle, User, documents, domain_of, user_id,
};
use crate::error::AppError;
use crate::federation::{KeyPair, sign_content};

pub(super) async fn create(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    object_type: &str,
    mut object: Map<String, Value>,
) -> Result<(), AppError> {
    if object_type == "User" {
        return create_user(ctx, activity, object).await;
    }

    inherit_addressing(activity, &mut object)?;

    let entity = match object_type {
        "Circle" => {
            stamp(ctx, activity, &mut object, "circle").await?;
            object.entry("members").or_insert_with(|| json!([]));
            Entity::Circle(decode(object, "circle")?)
        }
        "Group" => {
            stamp(ctx, activity, &mut object, "group").await?;
            object
                .entry("admins")
                .or_insert_with(|| json!([activity.actor_id]));
            object
                .entry("members")
                .or_insert_with(|| json!([activity.actor_id]));
            Entity::Group(decode(object, "group")?)
        }
        other => {
            let kind = ContentKind::from_object_type(other).ok_or_else(|| {
                AppError::Validation(format!("Unsupported objectType: {}", other))
            })?;
            Entity::Content(create_content(ctx, activity, kind, object).await?)
        }
    };

    let stored = match &entity {
        Entity::Circle(circle) => store(ctx, circle).await?,
        Entity::Group(group) => store(ctx, group).await?,
        Entity::Content(content) => store(ctx, content).await?,
        _ => false,
    };
    if !stored {
        tracing::debug!(id = %entity.id(), "Relayed object already known");
    }

    let actor_name = ctx.display_name(&activity.actor_id).await;
    activity.summary = Some(format!("{} created {}", actor_name, entity.display_name()));
    activity.object_id = Some(entity.id().to_string());
    activity.object = Some(entity.to_json()?);
    Ok(())
}

async fn create_content(
    ctx: &mut HandlerContext<'_>,
    activity: &Activity,
    kind: ContentKind,
    mut object: Map<String, Value>,
) -> Result<ContentObject, AppError> {
    if kind == ContentKind::Page && !ctx.is_admin(&activity.actor_id).await? {
        return Err(AppError::Forbidden("Only admins can create pages".to_string()));
    }

    if kind == ContentKind::Reply {
        let parent = object
            .get("inReplyTo")
            .or_else(|| object.get("replyTo"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::Validation("inReplyTo is required for a reply".to_string()))?;
        ctx.visible_entity(&activity.actor_id, &parent).await?;
    }

    stamp(ctx, activity, &mut object, kind.id_prefix()).await?;
    object.insert("type".to_string(), serde_json::to_value(kind)?);
    object.insert("reactionCount".to_string(), json!(0));
    decode(object, kind.id_prefix())
}

/// Assign id, owner, timestamps and (for local objects) the signature
async fn stamp(
    ctx: &mut HandlerContext<'_>,
    activity: &Activity,
    object: &mut Map<String, Value>,
    prefix: &str,
) -> Result<String, AppError> {
    let now = serde_json::to_value(ctx.now)?;
    object.insert("actorId".to_string(), json!(activity.actor_id));
    object.remove("lifecycle");

    let id = if ctx.is_local() {
        let id = EntityId::scoped(prefix, ctx.domain());
        object.insert("id".to_string(), json!(id));
        object.insert("createdAt".to_string(), now.clone());
        object.insert("updatedAt".to_string(), now);
        let signature = ctx.sign_as(&activity.actor_id, &id).await?;
        object.insert("signature".to_string(), json!(signature));
        id
    } else {
        let id = relayed_object_id(activity, object)?;
        object.entry("createdAt").or_insert_with(|| now.clone());
        object.entry("updatedAt").or_insert(now);
        id
    };

    Ok(id)
}

fn relayed_object_id(activity: &Activity, object: &Map<String, Value>) -> Result<String, AppError> {
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("object.id is required for relayed objects".to_string()))?;
    if domain_of(id).is_none() || domain_of(id) != domain_of(&activity.actor_id) {
        return Err(AppError::Forbidden(format!(
            "{} may not create {}",
            activity.actor_id, id
        )));
    }
    Ok(id.to_string())
}

/// Addressing flows both ways between the activity and its object
///
/// An unaddressed object takes the activity's recipients; an unaddressed
/// activity takes the object's.
fn inherit_addressing(
    activity: &mut Activity,
    object: &mut Map<String, Value>,
) -> Result<(), AppError> {
    let object_addressing: Addressing = serde_json::from_value(Value::Object(object.clone()))
        .map_err(|e| AppError::Validation(format!("Invalid addressing: {}", e)))?;

    if object_addressing.is_empty() {
        for field in ADDRESSING_FIELDS {
            object.remove(field);
        }
        if let Value::Object(fields) = serde_json::to_value(&activity.addressing)? {
            object.extend(fields);
        }
    } else if activity.addressing.is_empty() {
        activity.addressing = object_addressing;
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(object: Map<String, Value>, what: &str) -> Result<T, AppError> {
    serde_json::from_value(Value::Object(object))
        .map_err(|e| AppError::Validation(format!("Invalid {}: {}", what, e)))
}

async fn store<T: Document>(ctx: &mut HandlerContext<'_>, doc: &T) -> Result<bool, AppError> {
    if ctx.is_local() {
        documents::insert(ctx.conn, doc).await?;
        Ok(true)
    } else {
        documents::insert_if_absent(ctx.conn, doc).await
    }
}

async fn create_user(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    object: Map<String, Value>,
) -> Result<(), AppError> {
    let field = |name: &str| object.get(name).and_then(Value::as_str).map(str::to_string);
    let profile = match object.get("profile") {
        Some(Value::Object(profile)) => profile.clone(),
        _ => Map::new(),
    };

    let user = if ctx.is_local() {
        let username = field("username")
            .or_else(|| local_part(&activity.actor_id))
            .ok_or_else(|| AppError::Validation("username is required".to_string()))?;
        let username = normalize_username(&username)?;
        let id = user_id(&username, ctx.domain());
        if activity.actor_id.starts_with('@') && activity.actor_id != id {
            return Err(AppError::Validation(format!(
                "actorId {} does not match the new user {}",
                activity.actor_id, id
            )));
        }

        let keys = match std::mem::take(&mut ctx.prepared) {
            Prepared::Keys(keys) => keys,
            _ => {
                return Err(AppError::Internal(anyhow::anyhow!(
                    "keypair was not generated for new user"
                )));
            }
        };

        provision_user(
            ctx.conn,
            ctx.config,
            &username,
            field("email").as_deref(),
            profile,
            false,
            &keys,
            ctx.now,
        )
        .await?
    } else {
        remote_user(ctx, activity, &object, profile).await?
    };

    activity.actor_id = user.id.clone();
    activity.object_id = Some(user.id.clone());
    activity.summary = Some(format!("{} joined", user.display_name()));
    activity.object = Some(serde_json::to_value(&user)?);
    Ok(())
}

/// Record a peer's user so it can act here and be verified later
async fn remote_user(
    ctx: &mut HandlerContext<'_>,
    activity: &Activity,
    object: &Map<String, Value>,
    profile: Map<String, Value>,
) -> Result<User, AppError> {
    let id = relayed_object_id(activity, object)?;
    if id != activity.actor_id {
        return Err(AppError::Forbidden(format!(
            "{} may not register {}",
            activity.actor_id, id
        )));
    }
    let text = |name: &str| {
        object
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default()
    };
    let public_key = text("publicKey");
    if public_key.is_empty() {
        return Err(AppError::Validation(
            "publicKey is required for relayed users".to_string(),
        ));
    }

    let user = User {
        username: local_part(&id).unwrap_or_default(),
        id,
        email: None,
        public_key,
        profile,
        // personal circles live on the user's home server
        following: String::new(),
        blocked: String::new(),
        muted: String::new(),
        is_admin: false,
        lifecycle: Lifecycle::Active,
        created_at: ctx.now,
        updated_at: ctx.now,
    };
    documents::insert_if_absent(ctx.conn, &user).await?;
    Ok(user)
}

fn local_part(actor_id: &str) -> Option<String> {
    let name = actor_id.strip_prefix('@')?.split('@').next()?;
    (!name.is_empty()).then(|| name.to_string())
}

/// Lowercase, trimmed, `[a-z0-9_.-]+`
pub(crate) fn normalize_username(username: &str) -> Result<String, AppError> {
    let username = username.trim().to_lowercase();
    if username.is_empty() {
        return Err(AppError::Validation("username must not be empty".to_string()));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(AppError::Validation(format!(
            "username {} may only contain letters, digits, '_', '.' and '-'",
            username
        )));
    }
    Ok(username)
}

/// Create a local user with its keys and personal circles
#[allow(clippy::too_many_arguments)]
pub(crate) async fn provision_user(
    conn: &mut SqliteConnection,
    config: &AppConfig,
    username: &str,
    email: Option<&str>,
    profile: Map<String, Value>,
    is_admin: bool,
    keys: &KeyPair,
    now: DateTime<Utc>,
) -> Result<User, AppError> {
    let domain = &config.server.domain;
    let username = normalize_username(username)?;
    let id = user_id(&username, domain);
    if documents::exists(conn, &id).await? {
        return Err(AppError::Validation(format!("username {} is taken", username)));
    }

    let email = email
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty());

    data::store_keys(conn, &id, &keys.private_key_pem, &keys.public_key_pem).await?;

    let mut circle_ids = Vec::with_capacity(3);
    for name in ["following", "blocked", "muted"] {
        let circle_id = EntityId::derived("circle", domain, &[&id, name]);
        let circle = Circle {
            id: circle_id.clone(),
            actor_id: id.clone(),
            name: name.to_string(),
            members: Vec::new(),
            addressing: Addressing::default(),
            lifecycle: Lifecycle::Active,
            signature: Some(sign_content(&circle_id, &keys.private_key_pem)?),
            created_at: now,
            updated_at: now,
        };
        documents::insert(conn, &circle).await?;
        circle_ids.push(circle_id);
    }
    let [following, blocked, muted]: [String; 3] = circle_ids
        .try_into()
        .map_err(|_| AppError::Internal(anyhow::anyhow!("personal circles not created")))?;

    let user = User {
        id,
        username,
        email,
        public_key: keys.public_key_pem.clone(),
        profile,
        following,
        blocked,
        muted,
        is_admin,
        lifecycle: Lifecycle::Active,
        created_at: now,
        updated_at: now,
    };
    documents::insert(conn, &user).await?;

    tracing::info!(user = %user.id, "User created");
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_username() {
        assert_eq!(normalize_username("  Alice ").unwrap(), "alice");
        assert!(normalize_username("   ").is_err());
        assert!(normalize_username("al ice").is_err());
        assert!(normalize_username("al@ice").is_err());
    }

    #[test]
    fn test_local_part() {
        assert_eq!(local_part("@alice@a.example").as_deref(), Some("alice"));
        assert_eq!(local_part("alice"), None);
        assert_eq!(local_part("@@a.example"), None);
    }

    #[test]
    fn test_inherit_addressing_both_ways() {
        let mut activity: Activity = serde_json::from_value(json!({
            "id": "activity:1@a.example",
            "type": "Create",
            "actorId": "@alice@a.example",
            "to": ["@public"],
            "createdAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        let mut object = Map::new();
        inherit_addressing(&mut activity, &mut object).unwrap();
        assert_eq!(object.get("to"), Some(&json!(["@public"])));

        activity.addressing = Addressing::default();
        let mut object = Map::new();
        object.insert("bcc".to_string(), json!(["circle:1@a.example"]));
        inherit_addressing(&mut activity, &mut object).unwrap();
        assert!(activity.addressing.bcc.contains("circle:1@a.example"));
    }
}
