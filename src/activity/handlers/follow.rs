use super::{HandlerContext, Prepared, notify_remote_owner};
use crate::data::{
    self, Activity, Addressing, Entity, Feed, FeedItem, Lifecycle, MemberList, documents,
    domain_of, is_local_id,
};
use crate::error::AppError;
use crate::federation::RemoteFeed;

pub(crate) fn is_feed_url(target: &str) -> bool {
    target.starts_with("https://") || target.starts_with("http://")
}

/// Resolve what a Follow points at: a local or known entity id, a remote
/// actor we have not seen yet, or a feed URL.
async fn resolve_target(ctx: &mut HandlerContext<'_>, target: &str) -> Result<String, AppError> {
    if is_feed_url(target) {
        let feed_id = Feed::id_for(target, ctx.domain());
        if let Some(feed) = documents::find::<Feed>(ctx.conn, &feed_id).await? {
            if !feed.lifecycle.is_deleted() {
                return Ok(feed_id);
            }
        }
        let Prepared::Feed(remote) = std::mem::take(&mut ctx.prepared) else {
            return Err(AppError::Federation(format!("could not fetch feed {}", target)));
        };
        return import_feed(ctx, &feed_id, remote).await;
    }

    match documents::find_entity(ctx.conn, target).await? {
        Some(entity) if entity.lifecycle().is_deleted() => Err(AppError::NotFound(target.to_string())),
        Some(Entity::User(_)) | Some(Entity::Feed(_)) => Ok(target.to_string()),
        Some(Entity::Group(_)) => Err(AppError::Validation(
            "groups are joined, not followed".to_string(),
        )),
        Some(other) => Err(AppError::Validation(format!(
            "cannot follow a {}",
            other.kind().as_str()
        ))),
        None if target.starts_with('@') && !is_local_id(target, ctx.domain()) => {
            Ok(target.to_string())
        }
        None => Err(AppError::NotFound(target.to_string())),
    }
}

/// Store a freshly fetched feed and its items. Items already seen are kept.
async fn import_feed(
    ctx: &mut HandlerContext<'_>,
    feed_id: &str,
    remote: RemoteFeed,
) -> Result<String, AppError> {
    let feed = Feed {
        id: feed_id.to_string(),
        actor_id: remote.actor_id,
        url: remote.url,
        title: remote.title,
        format: remote.format,
        addressing: Addressing::public(),
        lifecycle: Lifecycle::Active,
        created_at: ctx.now,
        updated_at: ctx.now,
    };
    documents::save(ctx.conn, &feed).await?;

    let mut imported = 0usize;
    for item in remote.items {
        let record = FeedItem {
            id: FeedItem::id_for(feed_id, &item.key, ctx.domain()),
            feed_id: feed_id.to_string(),
            actor_id: item.actor_id,
            url: item.url,
            title: item.title,
            content: item.content,
            published_at: item.published_at,
            reaction_count: 0,
            addressing: Addressing::public(),
            lifecycle: Lifecycle::Active,
            created_at: ctx.now,
        };
        if documents::insert_if_absent(ctx.conn, &record).await? {
            imported += 1;
        }
    }

    tracing::info!(feed = %feed.url, imported, "Imported feed");
    Ok(feed_id.to_string())
}

fn remote_actor_domain<'a>(id: &'a str, local_domain: &str) -> Option<&'a str> {
    if id.starts_with('@') && !is_local_id(id, local_domain) {
        domain_of(id)
    } else {
        None
    }
}

pub(super) async fn follow(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    target: &str,
) -> Result<(), AppError> {
    let actor = activity.actor_id.clone();

    // A follower on another server keeps its own following circle
    if !is_local_id(&actor, ctx.domain()) {
        let actor_name = ctx.display_name(&actor).await;
        let target_name = ctx.display_name(target).await;
        activity.summary = Some(format!("{} followed {}", actor_name, target_name));
        activity.object_id = Some(target.to_string());
        return Ok(());
    }

    let followed = resolve_target(ctx, target).await?;
    if followed == actor {
        return Err(AppError::Validation("cannot follow yourself".to_string()));
    }

    let user = ctx.user(&actor).await?;
    let mut following = ctx.personal_circle(&actor, &user.following).await?;
    if following.members.add_member(&followed, ctx.now) {
        following.updated_at = ctx.now;
        documents::save(ctx.conn, &following).await?;
        if let Some(domain) = remote_actor_domain(&followed, ctx.domain()) {
            data::adjust_follower_count(ctx.conn, domain, 1, ctx.now).await?;
        }
    }

    let actor_name = ctx.display_name(&actor).await;
    let target_name = ctx.display_name(&followed).await;
    activity.summary = Some(format!("{} followed {}", actor_name, target_name));
    activity.object_id = Some(followed.clone());
    notify_remote_owner(activity, &followed, &ctx.config.server.domain);
    Ok(())
}

pub(super) async fn unfollow(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    target: &str,
) -> Result<(), AppError> {
    let actor = activity.actor_id.clone();
    let followed = if is_feed_url(target) {
        Feed::id_for(target, ctx.domain())
    } else {
        target.to_string()
    };

    if is_local_id(&actor, ctx.domain()) {
        let user = ctx.user(&actor).await?;
        let mut following = ctx.personal_circle(&actor, &user.following).await?;
        if following.members.remove_member(&followed) {
            following.updated_at = ctx.now;
            documents::save(ctx.conn, &following).await?;
            if let Some(domain) = remote_actor_domain(&followed, ctx.domain()) {
                data::adjust_follower_count(ctx.conn, domain, -1, ctx.now).await?;
            }
        }
        notify_remote_owner(activity, &followed, &ctx.config.server.domain);
    }

    let actor_name = ctx.display_name(&actor).await;
    let target_name = ctx.display_name(&followed).await;
    activity.summary = Some(format!("{} unfollowed {}", actor_name, target_name));
    activity.object_id = Some(followed);
    Ok(())
}
