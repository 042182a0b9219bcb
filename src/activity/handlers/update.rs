use serde_json::{Map, Value};

use super::HandlerContext;
use crate::activity::merge::merge_patch;
use crate::data::{Activity, Entity, documents};
use crate::error::AppError;

/// Patch an entity owned (or administered) by the actor
pub(super) async fn update(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    target: &str,
    patch: Map<String, Value>,
) -> Result<(), AppError> {
    let entity = ctx.live_entity(target).await?;
    // activities and reactions only change through their own verbs
    if matches!(entity, Entity::Activity(_) | Entity::React(_)) {
        return Err(AppError::Validation(format!(
            "{} cannot be updated",
            entity.kind().as_str()
        )));
    }
    let actor = activity.actor_id.clone();
    let by_admin = ctx.is_admin(&actor).await?;
    if !entity.is_managed_by(&actor) && !by_admin {
        return Err(AppError::Forbidden(format!("{} cannot update {}", actor, target)));
    }

    let kind = entity.kind();
    let Value::Object(mut body) = entity.to_json()? else {
        return Err(AppError::Internal(anyhow::anyhow!(
            "stored document {} is not an object",
            target
        )));
    };

    let ignored = merge_patch(&mut body, &patch, by_admin);
    if !ignored.is_empty() {
        tracing::debug!(id = %target, fields = ?ignored, "Ignored immutable fields in update");
    }

    let mut updated = Entity::from_json(kind, Value::Object(body))
        .map_err(|e| AppError::Validation(format!("Invalid update: {}", e)))?;
    updated.touch(ctx.now);
    documents::save_entity(ctx.conn, &updated).await?;

    let actor_name = ctx.display_name(&actor).await;
    activity.summary = Some(format!("{} updated {}", actor_name, updated.display_name()));
    activity.object_id = Some(target.to_string());
    Ok(())
}
