//! Verb handlers
//!
//! Every handler runs on the dispatch transaction and decorates the activity
//! with a `summary` and, when it names one, an `objectId`. An `Err` aborts
//! the whole dispatch.

mod create;
mod delete;
mod follow;
mod membership;
mod moderation;
mod react;
mod update;

pub(crate) use create::provision_user;
pub(crate) use follow::is_feed_url;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::audience::{Viewer, can_view};
use super::dispatcher::Origin;
use super::envelope::Command;
use crate::config::AppConfig;
use crate::data::{self, Activity, Circle, Entity, User, documents, is_local_id};
use crate::error::AppError;
use crate::federation::{KeyPair, RemoteFeed, sign_content};

/// Work done before the transaction opens
#[derive(Debug, Default)]
pub(crate) enum Prepared {
    #[default]
    Nothing,
    /// Keypair for a new local user
    Keys(KeyPair),
    /// Freshly fetched remote feed for a Follow
    Feed(RemoteFeed),
}

pub(crate) struct HandlerContext<'a> {
    pub conn: &'a mut SqliteConnection,
    pub config: &'a AppConfig,
    pub origin: &'a Origin,
    pub now: DateTime<Utc>,
    pub prepared: Prepared,
}

impl HandlerContext<'_> {
    pub fn domain(&self) -> &str {
        &self.config.server.domain
    }

    pub fn is_local(&self) -> bool {
        matches!(self.origin, Origin::Local)
    }

    /// Live entity or `NotFound`
    pub async fn live_entity(&mut self, id: &str) -> Result<Entity, AppError> {
        documents::find_entity(self.conn, id)
            .await?
            .filter(|entity| !entity.lifecycle().is_deleted())
            .ok_or_else(|| AppError::NotFound(id.to_string()))
    }

    /// Live entity the actor is allowed to see
    pub async fn visible_entity(&mut self, actor_id: &str, id: &str) -> Result<Entity, AppError> {
        let entity = self.live_entity(id).await?;
        if let Some(addressing) = entity.addressing() {
            let viewer = Viewer::load(self.conn, actor_id, &self.config.server.domain).await?;
            if !can_view(&viewer, entity.owner(), addressing) {
                return Err(AppError::Forbidden(format!("{} cannot see {}", actor_id, id)));
            }
        }
        Ok(entity)
    }

    /// Actor's user record, required to be live
    pub async fn user(&mut self, actor_id: &str) -> Result<User, AppError> {
        documents::find::<User>(self.conn, actor_id)
            .await?
            .filter(|user| !user.lifecycle.is_deleted())
            .ok_or_else(|| AppError::NotFound(format!("actor {}", actor_id)))
    }

    /// Local admins only; remote `isAdmin` flags are not trusted
    pub async fn is_admin(&mut self, actor_id: &str) -> Result<bool, AppError> {
        if !is_local_id(actor_id, &self.config.server.domain) {
            return Ok(false);
        }
        Ok(documents::find::<User>(self.conn, actor_id)
            .await?
            .is_some_and(|user| user.is_admin && !user.lifecycle.is_deleted()))
    }

    pub async fn display_name(&mut self, id: &str) -> String {
        match documents::find_entity(self.conn, id).await {
            Ok(Some(entity)) => entity.display_name(),
            _ => id.to_string(),
        }
    }

    /// Provenance signature for a new local object
    pub async fn sign_as(&mut self, actor_id: &str, id: &str) -> Result<String, AppError> {
        let key = data::private_key(self.conn, actor_id)
            .await?
            .ok_or_else(|| AppError::Forbidden(format!("{} is not a local actor", actor_id)))?;
        sign_content(id, &key)
    }

    /// Load one of the actor's own circles (`following`, `blocked`, `muted`)
    ///
    /// The circle must belong to `owner`.
    pub async fn personal_circle(&mut self, owner: &str, circle_id: &str) -> Result<Circle, AppError> {
        let circle = documents::find::<Circle>(self.conn, circle_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("circle {}", circle_id)))?;
        if circle.actor_id != owner {
            return Err(AppError::Forbidden(format!(
                "circle {} does not belong to {}",
                circle_id, owner
            )));
        }
        Ok(circle)
    }
}

/// Address the activity to `owner` when it lives on another server
pub(crate) fn notify_remote_owner(activity: &mut Activity, owner: &str, local_domain: &str) {
    if owner.starts_with('@') && !is_local_id(owner, local_domain) {
        activity.addressing.to.insert(owner.to_string());
    }
}

/// Run the handler for `command`
pub(crate) async fn apply(
    ctx: &mut HandlerContext<'_>,
    activity: &mut Activity,
    command: Command,
) -> Result<(), AppError> {
    match command {
        Command::Create {
            object_type,
            object,
        } => create::create(ctx, activity, &object_type, object).await,
        Command::Update { target, patch } => update::update(ctx, activity, &target, patch).await,
        Command::Delete { target } => delete::delete(ctx, activity, &target).await,
        Command::Add { target, member } => membership::add(ctx, activity, &target, &member).await,
        Command::Remove { target, member } => {
            membership::remove(ctx, activity, &target, &member).await
        }
        Command::Approve { group, member } => {
            membership::approve(ctx, activity, &group, &member).await
        }
        Command::Reject { group, member } => {
            membership::reject(ctx, activity, &group, &member).await
        }
        Command::Join { group } => membership::join(ctx, activity, &group).await,
        Command::Leave { group } => membership::leave(ctx, activity, &group).await,
        Command::Follow { target } => follow::follow(ctx, activity, &target).await,
        Command::Unfollow { target } => follow::unfollow(ctx, activity, &target).await,
        Command::React { target, reaction } => {
            react::react(ctx, activity, &target, &reaction).await
        }
        Command::Unreact { target } => react::unreact(ctx, activity, &target).await,
        Command::Block { target } => {
            moderation::update_list(ctx, activity, &target, moderation::List::Blocked, true).await
        }
        Command::Unblock { target } => {
            moderation::update_list(ctx, activity, &target, moderation::List::Blocked, false).await
        }
        Command::Mute { target } => {
            moderation::update_list(ctx, activity, &target, moderation::List::Muted, true).await
        }
        Command::Unmute { target } => {
            moderation::update_list(ctx, activity, &target, moderation::List::Muted, false).await
        }
    }
}
