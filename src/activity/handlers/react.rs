use super::{HandlerContext, notify_remote_owner};
use crate::data::{Activity, Lifecycle, React, documents};
use crate::error::AppError;

/// One reaction per actor and target. Repeating a React is a no-op.
pub(super) async fn react(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    target: &str,
    reaction: &str,
) -> Result<(), AppError> {
    let actor = activity.actor_id.clone();
    let mut entity = ctx.visible_entity(&actor, target).await?;
    if entity.reaction_count_mut().is_none() {
        return Err(AppError::Validation(format!(
            "cannot react to a {}",
            entity.kind().as_str()
        )));
    }

    let react_id = React::id_for(&actor, target, ctx.domain());
    let owner = entity.owner().to_string();
    let actor_name = ctx.display_name(&actor).await;
    activity.summary = Some(format!("{} reacted to {}", actor_name, entity.display_name()));
    activity.object_id = Some(react_id.clone());

    if documents::exists(ctx.conn, &react_id).await? {
        tracing::debug!(id = %target, actor = %actor, "Duplicate reaction ignored");
        return Ok(());
    }

    let mut addressing = entity
        .addressing()
        .map(|addressing| addressing.redacted())
        .unwrap_or_default();
    addressing.to.insert(owner.clone());

    let signature = if ctx.is_local() {
        Some(ctx.sign_as(&actor, &react_id).await?)
    } else {
        None
    };

    let record = React {
        id: react_id,
        actor_id: actor,
        target: target.to_string(),
        reaction: reaction.to_string(),
        addressing,
        lifecycle: Lifecycle::Active,
        signature,
        created_at: ctx.now,
    };
    documents::insert(ctx.conn, &record).await?;

    if let Some(count) = entity.reaction_count_mut() {
        *count += 1;
    }
    documents::save_entity(ctx.conn, &entity).await?;

    notify_remote_owner(activity, &owner, &ctx.config.server.domain);
    Ok(())
}

pub(super) async fn unreact(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    target: &str,
) -> Result<(), AppError> {
    let actor = activity.actor_id.clone();
    let react_id = React::id_for(&actor, target, ctx.domain());

    let mut target_name = target.to_string();
    if documents::remove(ctx.conn, &react_id).await? {
        if let Some(mut entity) = documents::find_entity(ctx.conn, target).await? {
            if let Some(count) = entity.reaction_count_mut() {
                *count = (*count - 1).max(0);
            }
            documents::save_entity(ctx.conn, &entity).await?;
            target_name = entity.display_name();
            let owner = entity.owner().to_string();
            notify_remote_owner(activity, &owner, &ctx.config.server.domain);
        }
    }

    let actor_name = ctx.display_name(&actor).await;
    activity.summary = Some(format!("{} removed a reaction from {}", actor_name, target_name));
    activity.object_id = Some(target.to_string());
    Ok(())
}
