//! Audience resolution
//!
//! Visibility is decided from the recipient union (`to ∪ bto ∪ cc ∪ bcc`)
//! alone. A viewer's circle and group memberships are read once per request
//! into a [`Viewer`] and reused for every check in that request.

use sqlx::SqliteConnection;
use std::collections::BTreeSet;

use crate::data::{Addressing, PUBLIC, SERVER, documents, is_local_id};
use crate::error::AppError;

/// Caller identity plus a membership snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Viewer {
    pub id: Option<String>,
    pub memberships: BTreeSet<String>,
    /// Whether the viewer lives on this server
    pub local: bool,
}

impl Viewer {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Load `actor_id`'s memberships in one query
    pub async fn load(
        conn: &mut SqliteConnection,
        actor_id: &str,
        local_domain: &str,
    ) -> Result<Self, AppError> {
        Ok(Self {
            id: Some(actor_id.to_string()),
            memberships: documents::memberships(conn, actor_id).await?,
            local: is_local_id(actor_id, local_domain),
        })
    }

    pub fn is(&self, actor_id: &str) -> bool {
        self.id.as_deref() == Some(actor_id)
    }
}

/// Recipient ids that make an item visible to `viewer`
///
/// `{@public, viewer id, @server if local, every circle/group id}`
pub fn listing_predicate(viewer: &Viewer) -> BTreeSet<String> {
    let mut set = BTreeSet::from([PUBLIC.to_string()]);
    if let Some(id) = &viewer.id {
        set.insert(id.clone());
        if viewer.local {
            set.insert(SERVER.to_string());
        }
        set.extend(viewer.memberships.iter().cloned());
    }
    set
}

/// Whether `viewer` may see an item owned by `owner` with `addressing`
pub fn can_view(viewer: &Viewer, owner: &str, addressing: &Addressing) -> bool {
    if viewer.is(owner) {
        return true;
    }
    let allowed = listing_predicate(viewer);
    addressing
        .recipients()
        .into_iter()
        .any(|recipient| allowed.contains(recipient))
}

/// Addressing as shown to `viewer`: blind fields only for the owner
pub fn redact_for(viewer: &Viewer, owner: &str, addressing: &Addressing) -> Addressing {
    if viewer.is(owner) {
        addressing.clone()
    } else {
        addressing.redacted()
    }
}
