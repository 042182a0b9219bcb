//! Verb dispatch
//!
//! One dispatch is one transaction: the handler's writes, the stored
//! activity and its outbox rows commit together or not at all. When a
//! handler fails the transaction is dropped and the activity is recorded on
//! its own with the error attached.

use chrono::Utc;
use std::sync::Arc;

use super::envelope::{Command, Envelope, LOCAL_ACTOR_VERBS, decode};
use super::handlers::{self, HandlerContext, Prepared, is_feed_url};
use crate::config::AppConfig;
use crate::data::{
    Activity, Database, Entity, EntityId, Feed, Lifecycle, User, documents, domain_of, is_local_id,
};
use crate::error::AppError;
use crate::federation::{FeedFetcher, enqueue_activity, generate_keypair};
use crate::metrics::{ACTIVITIES_DISPATCHED, ACTIVITIES_REJECTED};

/// Where an activity came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Submitted by a client of this server
    Local,
    /// Relayed by an authenticated peer
    Remote { server: String },
}

impl Origin {
    pub fn label(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Remote { .. } => "remote",
        }
    }
}

/// Result of a dispatch that got past the envelope gate
///
/// `error` is set when the handler failed; the activity was still recorded.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub activity: Activity,
    pub error: Option<AppError>,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Check that the envelope's actor may arrive through `origin`
///
/// Clients act for local users (or sign up); peers act for their own users.
pub fn check_origin(envelope: &Envelope, origin: &Origin, local_domain: &str) -> Result<(), AppError> {
    let actor = envelope.actor();
    match origin {
        Origin::Local => {
            if !envelope.is_signup() && !is_local_id(actor, local_domain) {
                return Err(AppError::Forbidden(format!(
                    "{} is not a local actor",
                    actor
                )));
            }
        }
        Origin::Remote { server } => {
            if !domain_of(actor).is_some_and(|domain| domain.eq_ignore_ascii_case(server)) {
                return Err(AppError::Forbidden(format!(
                    "{} cannot act for {}",
                    server, actor
                )));
            }
        }
    }
    Ok(())
}

pub struct Dispatcher {
    db: Arc<Database>,
    config: Arc<AppConfig>,
    fetcher: Arc<dyn FeedFetcher>,
}

impl Dispatcher {
    pub fn new(db: Arc<Database>, config: Arc<AppConfig>, fetcher: Arc<dyn FeedFetcher>) -> Self {
        Self { db, config, fetcher }
    }

    /// Validate, authorize and apply one activity
    ///
    /// # Errors
    /// Envelope and actor-gate failures are returned directly and nothing is
    /// stored. Handler failures come back inside [`DispatchOutcome`].
    pub async fn dispatch(&self, envelope: &Envelope, origin: Origin) -> Result<DispatchOutcome, AppError> {
        let command = match self.admit(envelope, &origin).await {
            Ok(command) => command,
            Err(e) => {
                let (_, reason) = e.status_and_type();
                ACTIVITIES_REJECTED.with_label_values(&[reason]).inc();
                tracing::debug!(actor = %envelope.actor(), error = %e, "Activity rejected");
                return Err(e);
            }
        };

        let mut activity = self.build_activity(envelope, &command, &origin);
        if matches!(origin, Origin::Remote { .. }) {
            self.check_relayed_id(&activity.id).await?;
        }
        let prepared = self.prepare(&command, &activity, &origin).await?;

        match self.apply(&mut activity, command, &origin, prepared).await {
            Ok(()) => {
                ACTIVITIES_DISPATCHED
                    .with_label_values(&[activity.verb.as_str(), origin.label(), "ok"])
                    .inc();
                tracing::info!(
                    id = %activity.id,
                    verb = activity.verb.as_str(),
                    actor = %activity.actor_id,
                    origin = origin.label(),
                    "Activity dispatched"
                );
                Ok(DispatchOutcome {
                    activity,
                    error: None,
                })
            }
            Err(e) => {
                ACTIVITIES_DISPATCHED
                    .with_label_values(&[activity.verb.as_str(), origin.label(), "error"])
                    .inc();
                tracing::warn!(
                    id = %activity.id,
                    verb = activity.verb.as_str(),
                    actor = %activity.actor_id,
                    error = %e,
                    "Activity handler failed"
                );
                activity.error = Some(e.public_message());
                self.db.save(&activity).await?;
                Ok(DispatchOutcome {
                    activity,
                    error: Some(e),
                })
            }
        }
    }

    /// Envelope rules, origin rules and the local-actor gate
    async fn admit(&self, envelope: &Envelope, origin: &Origin) -> Result<Command, AppError> {
        let command = decode(envelope)?;
        check_origin(envelope, origin, &self.config.server.domain)?;

        if LOCAL_ACTOR_VERBS.contains(&command.verb()) {
            let known = is_local_id(envelope.actor(), &self.config.server.domain)
                && self
                    .db
                    .find::<User>(envelope.actor())
                    .await?
                    .is_some_and(|user| !user.lifecycle.is_deleted());
            if !known {
                return Err(AppError::Forbidden(format!(
                    "{} is not a known actor",
                    envelope.actor()
                )));
            }
        }
        Ok(command)
    }

    fn build_activity(&self, envelope: &Envelope, command: &Command, origin: &Origin) -> Activity {
        let actor_id = envelope.actor().to_string();
        let domain = &self.config.server.domain;

        // Peers name their own activities; keep the id so redelivery is idempotent
        let relayed_id = match origin {
            Origin::Remote { .. } => envelope
                .id
                .as_deref()
                .filter(|id| domain_of(id).is_some() && domain_of(id) == domain_of(&actor_id))
                .map(str::to_string),
            Origin::Local => None,
        };

        let now = Utc::now();
        let created_at = match origin {
            Origin::Remote { .. } => envelope.created_at.unwrap_or(now),
            Origin::Local => now,
        };

        Activity {
            id: relayed_id.unwrap_or_else(|| EntityId::scoped("activity", domain)),
            verb: command.verb(),
            actor_id,
            object_type: envelope.object_type.clone(),
            object: envelope.object.clone(),
            target: command.target().map(str::to_string),
            addressing: envelope.addressing.clone(),
            summary: None,
            object_id: None,
            error: None,
            lifecycle: Lifecycle::Active,
            created_at,
        }
    }

    /// A relayed id may only name an activity, never another stored document
    async fn check_relayed_id(&self, id: &str) -> Result<(), AppError> {
        match self.db.find_entity(id).await? {
            Some(Entity::Activity(_)) | None => Ok(()),
            Some(other) => {
                ACTIVITIES_REJECTED.with_label_values(&["forbidden"]).inc();
                Err(AppError::Forbidden(format!(
                    "{} already names a {}",
                    id,
                    other.kind().as_str()
                )))
            }
        }
    }

    /// Slow work that must not run inside the transaction
    async fn prepare(
        &self,
        command: &Command,
        activity: &Activity,
        origin: &Origin,
    ) -> Result<Prepared, AppError> {
        match command {
            Command::Create { object_type, .. } if object_type == "User" && *origin == Origin::Local => {
                Ok(Prepared::Keys(generate_keypair(self.config.identity.key_bits).await?))
            }
            Command::Follow { target }
                if is_feed_url(target) && is_local_id(&activity.actor_id, &self.config.server.domain) =>
            {
                let feed_id = Feed::id_for(target, &self.config.server.domain);
                let known = self
                    .db
                    .find::<Feed>(&feed_id)
                    .await?
                    .is_some_and(|feed| !feed.lifecycle.is_deleted());
                if known {
                    return Ok(Prepared::Nothing);
                }
                match self.fetcher.fetch(target).await {
                    Ok(feed) => Ok(Prepared::Feed(feed)),
                    Err(e) => {
                        tracing::warn!(url = %target, error = %e, "Feed fetch failed");
                        Ok(Prepared::Nothing)
                    }
                }
            }
            _ => Ok(Prepared::Nothing),
        }
    }

    async fn apply(
        &self,
        activity: &mut Activity,
        command: Command,
        origin: &Origin,
        prepared: Prepared,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let mut ctx = HandlerContext {
            conn: &mut *tx,
            config: &self.config,
            origin,
            now,
            prepared,
        };
        handlers::apply(&mut ctx, activity, command).await?;

        documents::save(&mut *tx, &*activity).await?;
        if *origin == Origin::Local {
            enqueue_activity(&mut *tx, activity, &self.config.server.domain, now).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    use crate::activity::audience::{Viewer, can_view};
    use crate::activity::test_support::{DOMAIN, Harness, harness};
    use crate::data::{
        Circle, ContentObject, DeliveryStatus, EntityKind, FeedFormat, Group, MemberList, PUBLIC,
    };
    use crate::federation::{MockFeedFetcher, RemoteFeed, RemoteItem};

    fn dispatcher(h: &Harness) -> Dispatcher {
        Dispatcher::new(h.db.clone(), h.config.clone(), Arc::new(MockFeedFetcher::new()))
    }

    fn envelope(value: Value) -> Envelope {
        Envelope::from_json(value).unwrap()
    }

    async fn submit(dispatcher: &Dispatcher, value: Value) -> DispatchOutcome {
        dispatcher.dispatch(&envelope(value), Origin::Local).await.unwrap()
    }

    async fn viewer(h: &Harness, id: &str) -> Viewer {
        let mut conn = h.db.pool().acquire().await.unwrap();
        Viewer::load(&mut *conn, id, DOMAIN).await.unwrap()
    }

    async fn create_post(d: &Dispatcher, actor: &str, addressing: Value) -> String {
        let mut body = json!({
            "type": "Create",
            "actorId": actor,
            "objectType": "Note",
            "object": {"content": "hello"}
        });
        if let (Value::Object(body), Value::Object(fields)) = (&mut body, addressing) {
            body.extend(fields);
        }
        let outcome = submit(d, body).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        outcome.activity.object_id.unwrap()
    }

    #[tokio::test]
    async fn test_public_note_is_owned_by_actor_and_visible_to_all() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let d = dispatcher(&h);

        let outcome = submit(
            &d,
            json!({
                "type": "Create",
                "actorId": alice.id,
                "objectType": "Note",
                "object": {"actorId": "@mallory@a.example", "content": "hello"},
                "to": ["@public"]
            }),
        )
        .await;
        assert!(outcome.is_success(), "{:?}", outcome.error);

        let post_id = outcome.activity.object_id.clone().unwrap();
        let post: ContentObject = h.db.find(&post_id).await.unwrap().unwrap();
        assert_eq!(post.actor_id, alice.id);
        assert!(post.addressing.to.contains(PUBLIC));
        assert!(post.signature.is_some());
        assert!(can_view(&Viewer::anonymous(), &post.actor_id, &post.addressing));

        let stored: Activity = h.db.find(&outcome.activity.id).await.unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("alice created a post"));
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn test_blind_circle_post_visible_only_to_members() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let bob = h.user("bob", false).await;
        let carol = h.user("carol", false).await;
        let d = dispatcher(&h);

        let circle = submit(
            &d,
            json!({
                "type": "Create",
                "actorId": alice.id,
                "objectType": "Circle",
                "object": {"name": "friends"}
            }),
        )
        .await;
        let circle_id = circle.activity.object_id.unwrap();

        let added = submit(
            &d,
            json!({"type": "Add", "actorId": alice.id, "target": circle_id, "object": bob.id}),
        )
        .await;
        assert!(added.is_success(), "{:?}", added.error);

        let post_id = create_post(&d, &alice.id, json!({"bcc": [circle_id]})).await;
        let post: ContentObject = h.db.find(&post_id).await.unwrap().unwrap();

        assert!(can_view(&viewer(&h, &bob.id).await, &post.actor_id, &post.addressing));
        assert!(!can_view(&viewer(&h, &carol.id).await, &post.actor_id, &post.addressing));

        // carol cannot react to what she cannot see
        let react = submit(
            &d,
            json!({"type": "React", "actorId": carol.id, "target": post_id}),
        )
        .await;
        assert!(matches!(react.error, Some(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_follow_feed_url_imports_once() {
        let h = harness().await;
        let alice = h.user("alice", false).await;

        let url = "https://blog.example/rss";
        let mut fetcher = MockFeedFetcher::new();
        fetcher.expect_fetch().times(1).returning(|url| {
            let item = |key: &str| RemoteItem {
                key: key.to_string(),
                url: Some(key.to_string()),
                title: Some(format!("item {}", key)),
                content: None,
                published_at: None,
                actor_id: "@blog@blog.example".to_string(),
            };
            Ok(RemoteFeed {
                url: url.to_string(),
                title: Some("Blog".to_string()),
                format: FeedFormat::Syndication,
                actor_id: "@blog@blog.example".to_string(),
                items: vec![item("https://blog.example/1"), item("https://blog.example/2")],
            })
        });
        let d = Dispatcher::new(h.db.clone(), h.config.clone(), Arc::new(fetcher));

        for _ in 0..2 {
            let outcome = submit(
                &d,
                json!({"type": "Follow", "actorId": alice.id, "target": url}),
            )
            .await;
            assert!(outcome.is_success(), "{:?}", outcome.error);
        }

        let feed_id = Feed::id_for(url, DOMAIN);
        assert_eq!(h.db.count_documents(EntityKind::Feed).await.unwrap(), 1);
        assert_eq!(h.db.feed_items(&feed_id).await.unwrap().len(), 2);

        let following: Circle = h.db.find(&alice.following).await.unwrap().unwrap();
        let occurrences = following.members.iter().filter(|m| m.id == feed_id).count();
        assert_eq!(occurrences, 1);
    }

    #[tokio::test]
    async fn test_update_ignores_immutable_fields() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let d = dispatcher(&h);

        let outcome = submit(
            &d,
            json!({
                "type": "Update",
                "actorId": alice.id,
                "target": alice.id,
                "object": {
                    "id": "@evil@a.example",
                    "publicKey": "forged",
                    "isAdmin": true,
                    "profile": {"name": "Alice"}
                }
            }),
        )
        .await;
        assert!(outcome.is_success(), "{:?}", outcome.error);

        let user: User = h.db.find(&alice.id).await.unwrap().unwrap();
        assert_eq!(user.display_name(), "Alice");
        assert_eq!(user.public_key, alice.public_key);
        assert!(!user.is_admin);
    }

    #[tokio::test]
    async fn test_delete_twice_keeps_first_timestamp() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let d = dispatcher(&h);
        let post_id = create_post(&d, &alice.id, json!({"to": ["@public"]})).await;

        let delete = json!({"type": "Delete", "actorId": alice.id, "target": post_id});
        assert!(submit(&d, delete.clone()).await.is_success());
        let first: ContentObject = h.db.find(&post_id).await.unwrap().unwrap();

        assert!(submit(&d, delete).await.is_success());
        let second: ContentObject = h.db.find(&post_id).await.unwrap().unwrap();

        assert!(first.lifecycle.is_deleted());
        assert_eq!(first.lifecycle, second.lifecycle);
    }

    #[tokio::test]
    async fn test_react_is_deduplicated_and_counted() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let bob = h.user("bob", false).await;
        let d = dispatcher(&h);
        let post_id = create_post(&d, &alice.id, json!({"to": ["@public"]})).await;

        for _ in 0..2 {
            let outcome = submit(
                &d,
                json!({"type": "Like", "actorId": bob.id, "target": post_id}),
            )
            .await;
            assert!(outcome.is_success(), "{:?}", outcome.error);
        }
        let post: ContentObject = h.db.find(&post_id).await.unwrap().unwrap();
        assert_eq!(post.reaction_count, 1);

        let outcome = submit(
            &d,
            json!({"type": "Unreact", "actorId": bob.id, "target": post_id}),
        )
        .await;
        assert!(outcome.is_success());
        let post: ContentObject = h.db.find(&post_id).await.unwrap().unwrap();
        assert_eq!(post.reaction_count, 0);
    }

    #[tokio::test]
    async fn test_group_join_requires_approval() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let bob = h.user("bob", false).await;
        let carol = h.user("carol", false).await;
        let d = dispatcher(&h);

        let created = submit(
            &d,
            json!({
                "type": "Create",
                "actorId": alice.id,
                "objectType": "Group",
                "object": {"name": "club", "requiresApproval": true}
            }),
        )
        .await;
        let group_id = created.activity.object_id.unwrap();

        for user in [&bob, &carol] {
            let joined = submit(
                &d,
                json!({"type": "Join", "actorId": user.id, "target": group_id}),
            )
            .await;
            assert!(joined.is_success(), "{:?}", joined.error);
        }
        let group: Group = h.db.find(&group_id).await.unwrap().unwrap();
        assert!(group.pending.contains(&bob.id));
        assert!(!group.members.contains_member(&bob.id));

        // only admins approve
        let denied = submit(
            &d,
            json!({"type": "Approve", "actorId": carol.id, "target": group_id, "object": bob.id}),
        )
        .await;
        assert!(matches!(denied.error, Some(AppError::Forbidden(_))));

        let approved = submit(
            &d,
            json!({"type": "Approve", "actorId": alice.id, "target": group_id, "object": bob.id}),
        )
        .await;
        assert!(approved.is_success(), "{:?}", approved.error);
        let rejected = submit(
            &d,
            json!({"type": "Reject", "actorId": alice.id, "target": group_id, "object": carol.id}),
        )
        .await;
        assert!(rejected.is_success(), "{:?}", rejected.error);

        let group: Group = h.db.find(&group_id).await.unwrap().unwrap();
        assert!(group.members.contains_member(&alice.id));
        assert!(group.members.contains_member(&bob.id));
        assert!(!group.members.contains_member(&carol.id));
        assert!(group.pending.is_empty());
    }

    #[tokio::test]
    async fn test_block_and_unblock() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let d = dispatcher(&h);

        let blocked = submit(
            &d,
            json!({"type": "Block", "actorId": alice.id, "target": "@troll@b.example"}),
        )
        .await;
        assert!(blocked.is_success(), "{:?}", blocked.error);
        let circle: Circle = h.db.find(&alice.blocked).await.unwrap().unwrap();
        assert!(circle.members.contains_member("@troll@b.example"));

        submit(
            &d,
            json!({"type": "Unblock", "actorId": alice.id, "target": "@troll@b.example"}),
        )
        .await;
        let circle: Circle = h.db.find(&alice.blocked).await.unwrap().unwrap();
        assert!(circle.members.is_empty());
    }

    #[tokio::test]
    async fn test_failed_handler_records_activity_error() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let bob = h.user("bob", false).await;
        let d = dispatcher(&h);
        let post_id = create_post(&d, &alice.id, json!({"to": ["@public"]})).await;

        let outcome = submit(
            &d,
            json!({
                "type": "Update",
                "actorId": bob.id,
                "target": post_id,
                "object": {"content": "defaced"}
            }),
        )
        .await;
        assert!(matches!(outcome.error, Some(AppError::Forbidden(_))));

        let stored: Activity = h.db.find(&outcome.activity.id).await.unwrap().unwrap();
        assert!(stored.error.is_some());
        assert!(h.db.outbox_for_activity(&stored.id).await.unwrap().is_empty());

        let post: ContentObject = h.db.find(&post_id).await.unwrap().unwrap();
        assert_eq!(post.content.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_remote_recipient_gets_outbox_item() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let d = dispatcher(&h);

        let outcome = submit(
            &d,
            json!({
                "type": "Create",
                "actorId": alice.id,
                "objectType": "Note",
                "object": {"content": "hi zed"},
                "to": ["@zed@b.example"]
            }),
        )
        .await;
        assert!(outcome.is_success(), "{:?}", outcome.error);

        let items = h.db.outbox_for_activity(&outcome.activity.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].domain, "b.example");
        assert_eq!(items[0].status, DeliveryStatus::Pending);
        assert!(items[0].delivered_at.is_none());
    }

    #[tokio::test]
    async fn test_unknown_verb_is_rejected_without_storing() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let d = dispatcher(&h);

        let result = d
            .dispatch(
                &envelope(json!({"type": "Poke", "actorId": alice.id, "target": alice.id})),
                Origin::Local,
            )
            .await;
        assert!(matches!(result, Err(AppError::UnknownVerb(_))));
        assert_eq!(h.db.count_documents(EntityKind::Activity).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_local_actor_gate() {
        let h = harness().await;
        let d = dispatcher(&h);

        let result = d
            .dispatch(
                &envelope(json!({"type": "Block", "actorId": "@ghost@a.example", "target": "@x@b.example"})),
                Origin::Local,
            )
            .await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_peer_cannot_act_for_other_domains() {
        let h = harness().await;
        let d = dispatcher(&h);

        let result = d
            .dispatch(
                &envelope(json!({
                    "type": "Create",
                    "actorId": "@zed@c.example",
                    "objectType": "Note",
                    "object": {"id": "post:1@c.example"}
                })),
                Origin::Remote {
                    server: "b.example".to_string(),
                },
            )
            .await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_relayed_create_is_idempotent() {
        let h = harness().await;
        let d = dispatcher(&h);
        let origin = Origin::Remote {
            server: "b.example".to_string(),
        };

        let signup = envelope(json!({
            "id": "activity:1@b.example",
            "type": "Create",
            "actorId": "@zed@b.example",
            "objectType": "User",
            "object": {"id": "@zed@b.example", "publicKey": "pem"}
        }));
        assert!(d.dispatch(&signup, origin.clone()).await.unwrap().is_success());

        let note = envelope(json!({
            "id": "activity:2@b.example",
            "type": "Create",
            "actorId": "@zed@b.example",
            "objectType": "Note",
            "object": {"id": "post:1@b.example", "content": "from afar"},
            "to": ["@public"]
        }));
        for _ in 0..2 {
            let outcome = d.dispatch(&note, origin.clone()).await.unwrap();
            assert!(outcome.is_success(), "{:?}", outcome.error);
            assert_eq!(outcome.activity.id, "activity:2@b.example");
        }

        let post: ContentObject = h.db.find("post:1@b.example").await.unwrap().unwrap();
        assert_eq!(post.actor_id, "@zed@b.example");
        assert_eq!(h.db.count_documents(EntityKind::Post).await.unwrap(), 1);
        // relayed activities are never sent back out
        assert!(h.db.outbox_for_activity("activity:2@b.example").await.unwrap().is_empty());
    }

    fn remote() -> Origin {
        Origin::Remote {
            server: "b.example".to_string(),
        }
    }

    async fn relay_signup(d: &Dispatcher, extra: Value) {
        let mut object = json!({"id": "@zed@b.example", "publicKey": "pem"});
        if let (Value::Object(object), Value::Object(extra)) = (&mut object, extra) {
            object.extend(extra);
        }
        let signup = envelope(json!({
            "id": "activity:1@b.example",
            "type": "Create",
            "actorId": "@zed@b.example",
            "objectType": "User",
            "object": object
        }));
        assert!(d.dispatch(&signup, remote()).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_relayed_user_cannot_claim_local_circles() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let d = dispatcher(&h);

        relay_signup(
            &d,
            json!({"blocked": alice.blocked, "muted": alice.muted, "following": alice.following}),
        )
        .await;
        let zed: User = h.db.find("@zed@b.example").await.unwrap().unwrap();
        assert!(zed.blocked.is_empty());
        assert!(zed.muted.is_empty());
        assert!(zed.following.is_empty());

        let result = d
            .dispatch(
                &envelope(json!({
                    "id": "activity:2@b.example",
                    "type": "Block",
                    "actorId": "@zed@b.example",
                    "target": "@victim@c.example"
                })),
                remote(),
            )
            .await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));

        let circle: Circle = h.db.find(&alice.blocked).await.unwrap().unwrap();
        assert!(circle.members.is_empty());
    }

    #[tokio::test]
    async fn test_remote_actor_cannot_use_local_verbs() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let d = dispatcher(&h);
        relay_signup(&d, json!({})).await;

        for (verb, target) in [("Mute", "@x@c.example"), ("Update", alice.id.as_str())] {
            let result = d
                .dispatch(
                    &envelope(json!({
                        "type": verb,
                        "actorId": "@zed@b.example",
                        "target": target,
                        "object": {"profile": {"name": "Zed"}}
                    })),
                    remote(),
                )
                .await;
            assert!(matches!(result, Err(AppError::Forbidden(_))), "{}", verb);
        }
        assert_eq!(h.db.count_documents(EntityKind::Activity).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_personal_circle_must_belong_to_actor() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let mut bob = h.user("bob", false).await;
        let d = dispatcher(&h);

        bob.blocked = alice.blocked.clone();
        h.db.save(&bob).await.unwrap();

        let outcome = submit(
            &d,
            json!({"type": "Block", "actorId": bob.id, "target": "@troll@b.example"}),
        )
        .await;
        assert!(matches!(outcome.error, Some(AppError::Forbidden(_))));

        let circle: Circle = h.db.find(&alice.blocked).await.unwrap().unwrap();
        assert!(circle.members.is_empty());
    }

    #[tokio::test]
    async fn test_relayed_id_cannot_replace_other_documents() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let d = dispatcher(&h);
        relay_signup(&d, json!({})).await;

        let note = envelope(json!({
            "id": "activity:2@b.example",
            "type": "Create",
            "actorId": "@zed@b.example",
            "objectType": "Note",
            "object": {"id": "post:1@b.example", "content": "from afar"},
            "to": ["@public"]
        }));
        assert!(d.dispatch(&note, remote()).await.unwrap().is_success());

        let clash = envelope(json!({
            "id": "post:1@b.example",
            "type": "Follow",
            "actorId": "@zed@b.example",
            "target": alice.id
        }));
        let result = d.dispatch(&clash, remote()).await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));

        let post: ContentObject = h.db.find("post:1@b.example").await.unwrap().unwrap();
        assert_eq!(post.content.as_deref(), Some("from afar"));
        assert_eq!(h.db.count_documents(EntityKind::Activity).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_refuses_activities_and_reactions() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let d = dispatcher(&h);

        let created = submit(
            &d,
            json!({
                "type": "Create",
                "actorId": alice.id,
                "objectType": "Note",
                "object": {"content": "hello"},
                "to": ["@public"]
            }),
        )
        .await;
        let post_id = created.activity.object_id.clone().unwrap();
        let reacted = submit(
            &d,
            json!({"type": "React", "actorId": alice.id, "target": post_id}),
        )
        .await;
        let react_id = reacted.activity.object_id.clone().unwrap();

        for target in [created.activity.id.as_str(), react_id.as_str()] {
            let outcome = submit(
                &d,
                json!({
                    "type": "Update",
                    "actorId": alice.id,
                    "target": target,
                    "object": {"summary": "rewritten", "error": null}
                }),
            )
            .await;
            assert!(matches!(outcome.error, Some(AppError::Validation(_))), "{}", target);
        }

        let stored: Activity = h.db.find(&created.activity.id).await.unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("alice created a post"));
    }

    #[tokio::test]
    async fn test_pages_are_admin_only() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let root = h.user("root", true).await;
        let d = dispatcher(&h);

        let page = |actor: &str| {
            json!({
                "type": "Create",
                "actorId": actor,
                "objectType": "Page",
                "object": {"content": "about us"},
                "to": ["@public"]
            })
        };

        let denied = submit(&d, page(&alice.id)).await;
        assert!(matches!(denied.error, Some(AppError::Forbidden(_))));
        assert_eq!(h.db.count_documents(EntityKind::Post).await.unwrap(), 0);

        let created = submit(&d, page(&root.id)).await;
        assert!(created.is_success(), "{:?}", created.error);
    }

    #[tokio::test]
    async fn test_group_membership_lifecycle() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let bob = h.user("bob", false).await;
        let carol = h.user("carol", false).await;
        let d = dispatcher(&h);

        let created = submit(
            &d,
            json!({
                "type": "Create",
                "actorId": alice.id,
                "objectType": "Group",
                "object": {"name": "club", "requiresApproval": true}
            }),
        )
        .await;
        let group_id = created.activity.object_id.unwrap();
        let group: Group = h.db.find(&group_id).await.unwrap().unwrap();
        assert_eq!(group.admins.iter().collect::<Vec<_>>(), vec![&alice.id]);
        assert_eq!(group.members.len(), 1);
        assert!(group.members.contains_member(&alice.id));

        // an admin adding to an approval group only queues the member
        let added = submit(
            &d,
            json!({"type": "Add", "actorId": alice.id, "target": group_id, "object": bob.id}),
        )
        .await;
        assert!(added.is_success(), "{:?}", added.error);
        let group: Group = h.db.find(&group_id).await.unwrap().unwrap();
        assert!(group.pending.contains(&bob.id));
        assert!(!group.members.contains_member(&bob.id));

        submit(
            &d,
            json!({"type": "Approve", "actorId": alice.id, "target": group_id, "object": bob.id}),
        )
        .await;
        submit(&d, json!({"type": "Join", "actorId": carol.id, "target": group_id})).await;
        submit(
            &d,
            json!({"type": "Approve", "actorId": alice.id, "target": group_id, "object": carol.id}),
        )
        .await;

        let left = submit(&d, json!({"type": "Leave", "actorId": bob.id, "target": group_id})).await;
        assert!(left.is_success(), "{:?}", left.error);

        let removed = submit(
            &d,
            json!({"type": "Remove", "actorId": alice.id, "target": group_id, "object": carol.id}),
        )
        .await;
        assert!(removed.is_success(), "{:?}", removed.error);

        let owner_leaves =
            submit(&d, json!({"type": "Leave", "actorId": alice.id, "target": group_id})).await;
        assert!(matches!(owner_leaves.error, Some(AppError::Validation(_))));

        let group: Group = h.db.find(&group_id).await.unwrap().unwrap();
        assert!(!group.members.contains_member(&bob.id));
        assert!(!group.members.contains_member(&carol.id));
        assert!(group.members.contains_member(&alice.id));
    }

    #[tokio::test]
    async fn test_circle_remove_requires_owner() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let bob = h.user("bob", false).await;
        let d = dispatcher(&h);

        let circle = submit(
            &d,
            json!({
                "type": "Create",
                "actorId": alice.id,
                "objectType": "Circle",
                "object": {"name": "friends"}
            }),
        )
        .await;
        let circle_id = circle.activity.object_id.unwrap();
        submit(
            &d,
            json!({"type": "Add", "actorId": alice.id, "target": circle_id, "object": bob.id}),
        )
        .await;

        let denied = submit(
            &d,
            json!({"type": "Remove", "actorId": bob.id, "target": circle_id, "object": bob.id}),
        )
        .await;
        assert!(matches!(denied.error, Some(AppError::Forbidden(_))));

        let removed = submit(
            &d,
            json!({"type": "Remove", "actorId": alice.id, "target": circle_id, "object": bob.id}),
        )
        .await;
        assert!(removed.is_success(), "{:?}", removed.error);
        let circle: Circle = h.db.find(&circle_id).await.unwrap().unwrap();
        assert!(circle.members.is_empty());
    }

    #[tokio::test]
    async fn test_mute_and_unmute() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let d = dispatcher(&h);

        let muted = submit(
            &d,
            json!({"type": "Mute", "actorId": alice.id, "target": "@loud@b.example"}),
        )
        .await;
        assert!(muted.is_success(), "{:?}", muted.error);
        let circle: Circle = h.db.find(&alice.muted).await.unwrap().unwrap();
        assert!(circle.members.contains_member("@loud@b.example"));

        let unmuted = submit(
            &d,
            json!({"type": "Unmute", "actorId": alice.id, "target": "@loud@b.example"}),
        )
        .await;
        assert!(unmuted.is_success(), "{:?}", unmuted.error);
        let circle: Circle = h.db.find(&alice.muted).await.unwrap().unwrap();
        assert!(circle.members.is_empty());
    }

    #[tokio::test]
    async fn test_follow_then_unfollow_local_user() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let bob = h.user("bob", false).await;
        let d = dispatcher(&h);

        let followed = submit(
            &d,
            json!({"type": "Follow", "actorId": alice.id, "target": bob.id}),
        )
        .await;
        assert!(followed.is_success(), "{:?}", followed.error);
        let following: Circle = h.db.find(&alice.following).await.unwrap().unwrap();
        assert!(following.members.contains_member(&bob.id));

        let unfollowed = submit(
            &d,
            json!({"type": "Unfollow", "actorId": alice.id, "target": bob.id}),
        )
        .await;
        assert!(unfollowed.is_success(), "{:?}", unfollowed.error);
        let following: Circle = h.db.find(&alice.following).await.unwrap().unwrap();
        assert!(!following.members.contains_member(&bob.id));
    }

    #[tokio::test]
    async fn test_signup_provisions_user() {
        let h = harness().await;
        let d = dispatcher(&h);

        let outcome = submit(
            &d,
            json!({
                "type": "Create",
                "actorId": "@dave@a.example",
                "objectType": "User",
                "object": {"username": " Dave ", "email": " Dave@Mail.Example "}
            }),
        )
        .await;
        assert!(outcome.is_success(), "{:?}", outcome.error);

        let user: User = h.db.find("@dave@a.example").await.unwrap().unwrap();
        assert_eq!(user.username, "dave");
        assert_eq!(user.email.as_deref(), Some("dave@mail.example"));
        assert!(h.db.private_key(&user.id).await.unwrap().is_some());
        for circle in [&user.following, &user.blocked, &user.muted] {
            let circle: Circle = h.db.find(circle).await.unwrap().unwrap();
            assert_eq!(circle.actor_id, user.id);
        }
    }
}
