use super::HandlerContext;
use crate::data::{Activity, MemberList, documents};
use crate::error::AppError;

#[derive(Debug, Clone, Copy)]
pub(super) enum List {
    Blocked,
    Muted,
}

/// Add `target` to, or drop it from, one of the actor's moderation circles
pub(super) async fn update_list(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    target: &str,
    list: List,
    add: bool,
) -> Result<(), AppError> {
    let actor = activity.actor_id.clone();
    if target == actor {
        return Err(AppError::Validation("cannot block or mute yourself".to_string()));
    }

    let user = ctx.user(&actor).await?;
    let circle_id = match list {
        List::Blocked => &user.blocked,
        List::Muted => &user.muted,
    };
    let mut circle = ctx.personal_circle(&actor, circle_id).await?;

    let changed = if add {
        circle.members.add_member(target, ctx.now)
    } else {
        circle.members.remove_member(target)
    };
    if changed {
        circle.updated_at = ctx.now;
        documents::save(ctx.conn, &circle).await?;
    }

    let verb = match (list, add) {
        (List::Blocked, true) => "blocked",
        (List::Blocked, false) => "unblocked",
        (List::Muted, true) => "muted",
        (List::Muted, false) => "unmuted",
    };
    let actor_name = ctx.display_name(&actor).await;
    let target_name = ctx.display_name(target).await;
    activity.summary = Some(format!("{} {} {}", actor_name, verb, target_name));
    activity.object_id = Some(circle.id);
    Ok(())
}
