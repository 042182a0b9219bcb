use super::HandlerContext;
use crate::data::{Activity, Lifecycle, documents};
use crate::error::AppError;

/// Soft delete
///
/// Deleting something already deleted succeeds without touching it, so the
/// first deletion time and author are kept.
pub(super) async fn delete(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    target: &str,
) -> Result<(), AppError> {
    let mut entity = documents::find_entity(ctx.conn, target)
        .await?
        .ok_or_else(|| AppError::NotFound(target.to_string()))?;

    let actor = activity.actor_id.clone();
    if !entity.is_managed_by(&actor) && !ctx.is_admin(&actor).await? {
        return Err(AppError::Forbidden(format!("{} cannot delete {}", actor, target)));
    }

    let actor_name = ctx.display_name(&actor).await;
    activity.object_id = Some(target.to_string());

    if entity.lifecycle().is_deleted() {
        tracing::debug!(id = %target, "Delete of already deleted entity");
        activity.summary = Some(format!("{} deleted {}", actor_name, entity.display_name()));
        return Ok(());
    }

    *entity.lifecycle_mut() = Lifecycle::Deleted {
        at: ctx.now,
        by: actor,
    };
    entity.touch(ctx.now);
    documents::save_entity(ctx.conn, &entity).await?;

    activity.summary = Some(format!("{} deleted {}", actor_name, entity.display_name()));
    Ok(())
}
