//! Activity service
//!
//! Glue between the HTTP layer and the dispatcher: authenticates the caller,
//! hands client activities to the dispatcher, queues peer activities and
//! replays them from the inbox.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::activity::{
    DispatchOutcome, Dispatcher, Envelope, Origin, Viewer, can_view, check_origin, decode,
    redact_for,
};
use crate::config::AppConfig;
use crate::data::{Activity, Database};
use crate::error::AppError;
use crate::federation::{Credentials, FeedFetcher, IdentityService, InboundProcessor};

pub struct ActivityService {
    db: Arc<Database>,
    config: Arc<AppConfig>,
    identity: Arc<IdentityService>,
    dispatcher: Dispatcher,
}

impl ActivityService {
    pub fn new(
        db: Arc<Database>,
        config: Arc<AppConfig>,
        identity: Arc<IdentityService>,
        fetcher: Arc<dyn FeedFetcher>,
    ) -> Self {
        let dispatcher = Dispatcher::new(db.clone(), config.clone(), fetcher);
        Self {
            db,
            config,
            identity,
            dispatcher,
        }
    }

    /// Client submission
    ///
    /// Signing up is the only activity accepted without credentials. Any
    /// other activity must be signed by the actor it names.
    ///
    /// # Errors
    /// - `InvalidActivity` / `UnknownVerb` for a bad envelope
    /// - `Unauthorized` without credentials, `InvalidSignature` for bad ones
    /// - `Forbidden` when the signer is not the activity's actor
    pub async fn submit(
        &self,
        body: Value,
        credentials: Option<&Credentials>,
    ) -> Result<DispatchOutcome, AppError> {
        let envelope = Envelope::from_json(body)?;
        decode(&envelope)?;

        if !envelope.is_signup() {
            let credentials = credentials.ok_or(AppError::Unauthorized)?;
            let signer = self.identity.authenticate_actor(credentials).await?;
            if signer != envelope.actor() {
                return Err(AppError::Forbidden(format!(
                    "{} cannot submit activities for {}",
                    signer,
                    envelope.actor()
                )));
            }
        }

        self.dispatcher.dispatch(&envelope, Origin::Local).await
    }

    /// Peer submission: validate and queue for the inbox sweep
    ///
    /// Accepts either `{"activity": {...}}` or a bare activity. Returns the
    /// inbox item id.
    pub async fn receive(&self, body: Value, server_domain: &str) -> Result<String, AppError> {
        let activity = match body {
            Value::Object(mut fields) if fields.contains_key("activity") => fields
                .remove("activity")
                .unwrap_or(Value::Null),
            other => other,
        };

        let envelope = Envelope::from_json(activity.clone())?;
        decode(&envelope)?;
        let origin = Origin::Remote {
            server: server_domain.to_string(),
        };
        check_origin(&envelope, &origin, &self.config.server.domain)?;

        let id = self.db.enqueue_inbox(server_domain, &activity).await?;
        tracing::info!(
            item = %id,
            server = %server_domain,
            verb = envelope.verb.as_deref().unwrap_or_default(),
            "Peer activity queued"
        );
        Ok(id)
    }

    /// Stored activity as `viewer` may see it
    ///
    /// Activities the viewer may not see are reported as missing.
    pub async fn get_activity(&self, id: &str, viewer_id: Option<&str>) -> Result<Activity, AppError> {
        let mut activity: Activity = self
            .db
            .find(id)
            .await?
            .ok_or_else(|| AppError::NotFound(id.to_string()))?;

        let viewer = match viewer_id {
            Some(viewer_id) => {
                let mut conn = self.db.pool().acquire().await?;
                Viewer::load(&mut *conn, viewer_id, &self.config.server.domain).await?
            }
            None => Viewer::anonymous(),
        };

        if !can_view(&viewer, &activity.actor_id, &activity.addressing) {
            return Err(AppError::NotFound(id.to_string()));
        }
        let owner = activity.actor_id.clone();
        activity.map_addressing(|addressing| redact_for(&viewer, &owner, addressing));
        Ok(activity)
    }
}

#[async_trait]
impl InboundProcessor for ActivityService {
    async fn process(&self, server_domain: &str, payload: &Value) -> Result<(), AppError> {
        let envelope = Envelope::from_json(payload.clone())?;

        if let Some(id) = envelope.id.as_deref() {
            let done = self
                .db
                .find::<Activity>(id)
                .await?
                .is_some_and(|activity| activity.error.is_none());
            if done {
                tracing::debug!(id = %id, "Peer activity already applied");
                return Ok(());
            }
        }

        let origin = Origin::Remote {
            server: server_domain.to_string(),
        };
        let outcome = self.dispatcher.dispatch(&envelope, origin).await?;
        match outcome.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::activity::test_support::{Harness, harness};
    use crate::data::{ContentObject, ProcessingStatus};
    use crate::federation::{MockFeedFetcher, MockPeerTransport, test_keypairs};

    fn service(h: &Harness) -> ActivityService {
        let identity = Arc::new(IdentityService::new(
            h.db.clone(),
            h.config.clone(),
            Arc::new(MockPeerTransport::new()),
        ));
        ActivityService::new(
            h.db.clone(),
            h.config.clone(),
            identity,
            Arc::new(MockFeedFetcher::new()),
        )
    }

    fn note(actor: &str) -> Value {
        json!({
            "type": "Create",
            "actorId": actor,
            "objectType": "Note",
            "object": {"content": "hello"},
            "to": ["@public"]
        })
    }

    #[tokio::test]
    async fn test_submit_requires_matching_signature() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let bob = h.user("bob", false).await;
        let service = service(&h);
        let (keys, _) = test_keypairs();

        let unsigned = service.submit(note(&alice.id), None).await;
        assert!(matches!(unsigned, Err(AppError::Unauthorized)));

        let as_bob = Credentials::sign(&bob.id, &keys.private_key_pem, Utc::now()).unwrap();
        let wrong_actor = service.submit(note(&alice.id), Some(&as_bob)).await;
        assert!(matches!(wrong_actor, Err(AppError::Forbidden(_))));

        let as_alice = Credentials::sign(&alice.id, &keys.private_key_pem, Utc::now()).unwrap();
        let outcome = service.submit(note(&alice.id), Some(&as_alice)).await.unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_invalid_envelope_is_rejected_before_auth() {
        let h = harness().await;
        let service = service(&h);

        let result = service
            .submit(json!({"type": "Update", "actorId": "@alice@a.example"}), None)
            .await;
        match result {
            Err(AppError::InvalidActivity(errors)) => {
                assert!(errors.contains(&"target is required for Update".to_string()));
                assert!(errors.contains(&"object is required for Update".to_string()));
            }
            other => panic!("expected InvalidActivity, got {:?}", other.map(|o| o.activity)),
        }
    }

    #[tokio::test]
    async fn test_receive_checks_actor_domain_and_queues() {
        let h = harness().await;
        let service = service(&h);

        let foreign = service
            .receive(json!({"activity": note("@zed@c.example")}), "b.example")
            .await;
        assert!(matches!(foreign, Err(AppError::Forbidden(_))));

        let id = service
            .receive(json!({"activity": note("@zed@b.example")}), "b.example")
            .await
            .unwrap();
        let item = h.db.get_inbox_item(&id).await.unwrap().unwrap();
        assert_eq!(item.status, ProcessingStatus::Pending);
        assert_eq!(item.server_domain, "b.example");
    }

    #[tokio::test]
    async fn test_process_applies_peer_activity() {
        let h = harness().await;
        let service = service(&h);

        let payload = json!({
            "id": "activity:9@b.example",
            "type": "Create",
            "actorId": "@zed@b.example",
            "objectType": "Note",
            "object": {"id": "post:9@b.example", "content": "relayed"},
            "to": ["@public"]
        });
        service.process("b.example", &payload).await.unwrap();
        // second delivery of the same activity is skipped
        service.process("b.example", &payload).await.unwrap();

        let post: ContentObject = h.db.find("post:9@b.example").await.unwrap().unwrap();
        assert_eq!(post.content.as_deref(), Some("relayed"));
    }

    #[tokio::test]
    async fn test_get_activity_redacts_blind_recipients() {
        let h = harness().await;
        let alice = h.user("alice", false).await;
        let bob = h.user("bob", false).await;
        let service = service(&h);
        let (keys, _) = test_keypairs();

        let mut body = note(&alice.id);
        body["bcc"] = json!([bob.id]);
        let credentials = Credentials::sign(&alice.id, &keys.private_key_pem, Utc::now()).unwrap();
        let outcome = service.submit(body, Some(&credentials)).await.unwrap();
        let id = outcome.activity.id;

        let as_owner = service.get_activity(&id, Some(&alice.id)).await.unwrap();
        assert!(as_owner.addressing.bcc.contains(&bob.id));
        assert_eq!(as_owner.object.as_ref().unwrap()["bcc"], json!([bob.id]));

        let as_public = service.get_activity(&id, None).await.unwrap();
        assert!(as_public.addressing.bcc.is_empty());
        assert!(as_public.addressing.to.contains("@public"));
        let object = as_public.object.unwrap();
        assert!(object.get("bcc").is_none());
        assert_eq!(object["to"], json!(["@public"]));
    }
}
