//! Circle and group membership: Add, Remove, Approve, Reject, Join, Leave

use super::{HandlerContext, notify_remote_owner};
use crate::data::{Activity, Circle, Entity, Group, MemberList, documents};
use crate::error::AppError;

enum MemberSet {
    Circle(Circle),
    Group(Group),
}

async fn load_set(ctx: &mut HandlerContext<'_>, id: &str) -> Result<MemberSet, AppError> {
    match ctx.live_entity(id).await? {
        Entity::Circle(circle) => Ok(MemberSet::Circle(circle)),
        Entity::Group(group) => Ok(MemberSet::Group(group)),
        other => Err(AppError::Validation(format!(
            "{} is a {}, not a circle or group",
            id,
            other.kind().as_str()
        ))),
    }
}

async fn load_group(ctx: &mut HandlerContext<'_>, id: &str) -> Result<Group, AppError> {
    match load_set(ctx, id).await? {
        MemberSet::Group(group) => Ok(group),
        MemberSet::Circle(_) => Err(AppError::Validation(format!("{} is not a group", id))),
    }
}

fn require_group_admin(group: &Group, actor: &str) -> Result<(), AppError> {
    if group.is_admin(actor) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "{} is not an admin of {}",
            actor, group.id
        )))
    }
}

async fn summarize(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    phrase: &str,
    member: Option<&str>,
    set_name: &str,
    set_id: &str,
) {
    let actor_name = ctx.display_name(&activity.actor_id).await;
    activity.summary = Some(match member {
        Some(member) => {
            let member_name = ctx.display_name(member).await;
            format!("{} {} {} {}", actor_name, phrase, member_name, set_name)
        }
        None => format!("{} {} {}", actor_name, phrase, set_name),
    });
    activity.object_id = Some(set_id.to_string());
}

pub(super) async fn add(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    target: &str,
    member: &str,
) -> Result<(), AppError> {
    let actor = activity.actor_id.clone();
    let name = match load_set(ctx, target).await? {
        MemberSet::Circle(mut circle) => {
            if circle.actor_id != actor {
                return Err(AppError::Forbidden(format!("{} does not own {}", actor, target)));
            }
            if circle.members.add_member(member, ctx.now) {
                circle.updated_at = ctx.now;
                documents::save(ctx.conn, &circle).await?;
            }
            format!("to {}", circle.name)
        }
        MemberSet::Group(mut group) => {
            require_group_admin(&group, &actor)?;
            if group.banned.contains(member) {
                return Err(AppError::Forbidden(format!(
                    "{} is banned from {}",
                    member, target
                )));
            }
            if !group.members.contains_member(member) {
                if group.requires_approval {
                    group.pending.insert(member.to_string());
                } else {
                    group.members.add_member(member, ctx.now);
                    group.pending.remove(member);
                }
                group.updated_at = ctx.now;
                documents::save(ctx.conn, &group).await?;
            }
            format!("to {}", group.name)
        }
    };

    summarize(ctx, activity, "added", Some(member), &name, target).await;
    Ok(())
}

pub(super) async fn remove(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    target: &str,
    member: &str,
) -> Result<(), AppError> {
    let actor = activity.actor_id.clone();
    let name = match load_set(ctx, target).await? {
        MemberSet::Circle(mut circle) => {
            if circle.actor_id != actor {
                return Err(AppError::Forbidden(format!("{} does not own {}", actor, target)));
            }
            if circle.members.remove_member(member) {
                circle.updated_at = ctx.now;
                documents::save(ctx.conn, &circle).await?;
            }
            format!("from {}", circle.name)
        }
        MemberSet::Group(mut group) => {
            require_group_admin(&group, &actor)?;
            if member == group.actor_id {
                return Err(AppError::Validation(
                    "the group owner cannot be removed".to_string(),
                ));
            }
            let removed = group.members.remove_member(member);
            let was_pending = group.pending.remove(member);
            let was_admin = group.admins.remove(member);
            if removed || was_pending || was_admin {
                group.updated_at = ctx.now;
                documents::save(ctx.conn, &group).await?;
            }
            format!("from {}", group.name)
        }
    };

    summarize(ctx, activity, "removed", Some(member), &name, target).await;
    Ok(())
}

pub(super) async fn approve(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    group_id: &str,
    member: &str,
) -> Result<(), AppError> {
    let mut group = load_group(ctx, group_id).await?;
    require_group_admin(&group, &activity.actor_id)?;

    if !group.pending.remove(member) {
        return Err(AppError::Validation(format!(
            "{} has no pending request for {}",
            member, group_id
        )));
    }
    group.members.add_member(member, ctx.now);
    group.updated_at = ctx.now;
    documents::save(ctx.conn, &group).await?;

    let name = format!("into {}", group.name);
    summarize(ctx, activity, "approved", Some(member), &name, group_id).await;
    notify_remote_owner(activity, member, &ctx.config.server.domain);
    Ok(())
}

pub(super) async fn reject(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    group_id: &str,
    member: &str,
) -> Result<(), AppError> {
    let mut group = load_group(ctx, group_id).await?;
    require_group_admin(&group, &activity.actor_id)?;

    if group.pending.remove(member) {
        group.updated_at = ctx.now;
        documents::save(ctx.conn, &group).await?;
    }

    let name = format!("from {}", group.name);
    summarize(ctx, activity, "rejected", Some(member), &name, group_id).await;
    Ok(())
}

pub(super) async fn join(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    group_id: &str,
) -> Result<(), AppError> {
    let actor = activity.actor_id.clone();
    let mut group = load_group(ctx, group_id).await?;

    if group.banned.contains(&actor) {
        return Err(AppError::Forbidden(format!("{} is banned from {}", actor, group_id)));
    }

    let phrase = if group.members.contains_member(&actor) {
        "joined"
    } else if group.requires_approval {
        if group.pending.insert(actor.clone()) {
            group.updated_at = ctx.now;
            documents::save(ctx.conn, &group).await?;
        }
        "asked to join"
    } else {
        group.members.add_member(&actor, ctx.now);
        group.updated_at = ctx.now;
        documents::save(ctx.conn, &group).await?;
        "joined"
    };

    let name = group.name.clone();
    summarize(ctx, activity, phrase, None, &name, group_id).await;
    notify_remote_owner(activity, &group.actor_id, &ctx.config.server.domain);
    Ok(())
}

pub(super) async fn leave(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    group_id: &str,
) -> Result<(), AppError> {
    let actor = activity.actor_id.clone();
    let mut group = load_group(ctx, group_id).await?;

    if group.actor_id == actor {
        return Err(AppError::Validation(
            "the group owner cannot leave the group".to_string(),
        ));
    }

    let removed = group.members.remove_member(&actor);
    let was_pending = group.pending.remove(&actor);
    let was_admin = group.admins.remove(&actor);
    if removed || was_pending || was_admin {
        group.updated_at = ctx.now;
        documents::save(ctx.conn, &group).await?;
    }

    let name = group.name.clone();
    summarize(ctx, activity, "left", None, &name, group_id).await;
    notify_remote_owner(activity, &group.actor_id, &ctx.config.server.domain);
    Ok(())
}
