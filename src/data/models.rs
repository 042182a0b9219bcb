//! Data models
//!
//! Entities are persisted as JSON documents (see `documents`), so every
//! entity struct here round-trips through serde with camelCase field names.
//! Queue and peer records are plain rows.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

// =============================================================================
// Identifiers
// =============================================================================

/// Recipient marker: anyone may view
pub const PUBLIC: &str = "@public";

/// Recipient marker: any actor local to the addressed server may view
pub const SERVER: &str = "@server";

/// Entity ID wrapper (ULID format, 26 characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Globally unique id of the form `prefix:ULID@domain`
    pub fn scoped(prefix: &str, domain: &str) -> String {
        format!("{}:{}@{}", prefix, Self::new().0.to_ascii_lowercase(), domain)
    }

    /// Stable id derived from `parts`, so the same inputs always name the
    /// same entity.
    pub fn derived(prefix: &str, domain: &str, parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hex::encode(hasher.finalize());
        format!("{}:{}@{}", prefix, &digest[..26], domain)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// Id of a user, e.g. `@alice@social.example.com`
pub fn user_id(username: &str, domain: &str) -> String {
    format!("@{}@{}", username, domain)
}

/// Domain part of an entity or actor id (text after the last `@`).
///
/// Returns `None` for the special recipients and for ids without a domain.
pub fn domain_of(id: &str) -> Option<&str> {
    if id == PUBLIC || id == SERVER {
        return None;
    }
    let (_, domain) = id.rsplit_once('@')?;
    let domain = domain.trim();
    (!domain.is_empty()).then_some(domain)
}

/// True when `id` belongs to `local_domain`
pub fn is_local_id(id: &str, local_domain: &str) -> bool {
    domain_of(id).is_some_and(|domain| domain.eq_ignore_ascii_case(local_domain))
}

// =============================================================================
// Shared building blocks
// =============================================================================

/// Soft-delete state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Lifecycle {
    #[default]
    Active,
    Deleted { at: DateTime<Utc>, by: String },
}

impl Lifecycle {
    pub fn is_deleted(&self) -> bool {
        matches!(self, Lifecycle::Deleted { .. })
    }
}

/// Addressing fields of an entity or activity
///
/// Each field accepts either a single id or a list on input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressing {
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "BTreeSet::is_empty")]
    pub to: BTreeSet<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "BTreeSet::is_empty")]
    pub bto: BTreeSet<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "BTreeSet::is_empty")]
    pub cc: BTreeSet<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "BTreeSet::is_empty")]
    pub bcc: BTreeSet<String>,
}

impl Addressing {
    pub fn public() -> Self {
        Self {
            to: BTreeSet::from([PUBLIC.to_string()]),
            ..Self::default()
        }
    }

    /// `to ∪ bto ∪ cc ∪ bcc`
    pub fn recipients(&self) -> BTreeSet<&str> {
        self.to
            .iter()
            .chain(&self.bto)
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(String::as_str)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.to.is_empty() && self.bto.is_empty() && self.cc.is_empty() && self.bcc.is_empty()
    }

    /// Copy without the blind fields
    pub fn redacted(&self) -> Self {
        Self {
            to: self.to.clone(),
            cc: self.cc.clone(),
            bto: BTreeSet::new(),
            bcc: BTreeSet::new(),
        }
    }

    /// Copy whose blind fields keep only recipients on `domain`
    pub fn for_domain(&self, domain: &str) -> Self {
        let keep = |set: &BTreeSet<String>| {
            set.iter()
                .filter(|id| is_local_id(id, domain))
                .cloned()
                .collect()
        };
        Self {
            to: self.to.clone(),
            cc: self.cc.clone(),
            bto: keep(&self.bto),
            bcc: keep(&self.bcc),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(id) => BTreeSet::from([id]),
        OneOrMany::Many(ids) => ids.into_iter().collect(),
        OneOrMany::Null(()) => BTreeSet::new(),
    })
}

/// Circle/Group member entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "MemberRepr")]
pub struct Member {
    pub id: String,
    pub added_at: DateTime<Utc>,
}

impl Member {
    pub fn new(id: impl Into<String>, added_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            added_at,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MemberRepr {
    Id(String),
    #[serde(rename_all = "camelCase")]
    Full {
        id: String,
        added_at: Option<DateTime<Utc>>,
    },
}

impl From<MemberRepr> for Member {
    fn from(repr: MemberRepr) -> Self {
        match repr {
            MemberRepr::Id(id) => Member::new(id, Utc::now()),
            MemberRepr::Full { id, added_at } => Member::new(id, added_at.unwrap_or_else(Utc::now)),
        }
    }
}

/// Membership list helpers shared by circles and groups
pub trait MemberList {
    fn contains_member(&self, id: &str) -> bool;
    /// Returns false if `id` was already present
    fn add_member(&mut self, id: &str, at: DateTime<Utc>) -> bool;
    /// Returns false if `id` was absent
    fn remove_member(&mut self, id: &str) -> bool;
}

impl MemberList for Vec<Member> {
    fn contains_member(&self, id: &str) -> bool {
        self.iter().any(|member| member.id == id)
    }

    fn add_member(&mut self, id: &str, at: DateTime<Utc>) -> bool {
        if self.contains_member(id) {
            return false;
        }
        self.push(Member::new(id, at));
        true
    }

    fn remove_member(&mut self, id: &str) -> bool {
        let before = self.len();
        self.retain(|member| member.id != id);
        self.len() != before
    }
}

// =============================================================================
// Entities
// =============================================================================

/// Storage kind of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Circle,
    Group,
    Post,
    Reply,
    Bookmark,
    Page,
    File,
    Event,
    React,
    Feed,
    FeedItem,
    Activity,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Circle => "circle",
            EntityKind::Group => "group",
            EntityKind::Post => "post",
            EntityKind::Reply => "reply",
            EntityKind::Bookmark => "bookmark",
            EntityKind::Page => "page",
            EntityKind::File => "file",
            EntityKind::Event => "event",
            EntityKind::React => "react",
            EntityKind::Feed => "feed",
            EntityKind::FeedItem => "feeditem",
            EntityKind::Activity => "activity",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "user" => EntityKind::User,
            "circle" => EntityKind::Circle,
            "group" => EntityKind::Group,
            "post" => EntityKind::Post,
            "reply" => EntityKind::Reply,
            "bookmark" => EntityKind::Bookmark,
            "page" => EntityKind::Page,
            "file" => EntityKind::File,
            "event" => EntityKind::Event,
            "react" => EntityKind::React,
            "feed" => EntityKind::Feed,
            "feeditem" => EntityKind::FeedItem,
            "activity" => EntityKind::Activity,
            _ => return None,
        })
    }
}

/// A value stored in the `documents` table
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    /// Whether rows of `kind` decode into this type
    fn accepts(kind: EntityKind) -> bool;
    fn kind(&self) -> EntityKind;
    fn id(&self) -> &str;
    /// Actor that owns the document
    fn owner(&self) -> &str;
}

macro_rules! single_kind_document {
    ($ty:ty, $kind:expr, $owner:ident) => {
        impl Document for $ty {
            fn accepts(kind: EntityKind) -> bool {
                kind == $kind
            }
            fn kind(&self) -> EntityKind {
                $kind
            }
            fn id(&self) -> &str {
                &self.id
            }
            fn owner(&self) -> &str {
                &self.$owner
            }
        }
    };
}

/// Local or known actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// PEM-encoded public key. The private half lives in `actor_keys`.
    pub public_key: String,
    #[serde(default)]
    pub profile: Map<String, Value>,
    /// Id of the `following` circle
    pub following: String,
    /// Id of the `blocked` circle
    pub blocked: String,
    /// Id of the `muted` circle
    pub muted: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

single_kind_document!(User, EntityKind::User, id);

impl User {
    pub fn display_name(&self) -> &str {
        self.profile
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Circle {
    pub id: String,
    pub actor_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(flatten)]
    pub addressing: Addressing,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

single_kind_document!(Circle, EntityKind::Circle, actor_id);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub actor_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub pending: BTreeSet<String>,
    #[serde(default)]
    pub admins: BTreeSet<String>,
    #[serde(default)]
    pub banned: BTreeSet<String>,
    #[serde(default, alias = "private")]
    pub requires_approval: bool,
    #[serde(flatten)]
    pub addressing: Addressing,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

single_kind_document!(Group, EntityKind::Group, actor_id);

impl Group {
    /// Owner or listed admin
    pub fn is_admin(&self, actor_id: &str) -> bool {
        self.actor_id == actor_id || self.admins.contains(actor_id)
    }
}

/// Kinds of authored content that share one document shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentKind {
    Post,
    Reply,
    Bookmark,
    Page,
    File,
    Event,
}

impl ContentKind {
    /// Maps a Create `objectType` to a content kind
    pub fn from_object_type(object_type: &str) -> Option<Self> {
        Some(match object_type {
            "Post" | "Note" | "Article" => ContentKind::Post,
            "Reply" => ContentKind::Reply,
            "Bookmark" => ContentKind::Bookmark,
            "Page" => ContentKind::Page,
            "File" => ContentKind::File,
            "Event" => ContentKind::Event,
            _ => return None,
        })
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            ContentKind::Post => EntityKind::Post,
            ContentKind::Reply => EntityKind::Reply,
            ContentKind::Bookmark => EntityKind::Bookmark,
            ContentKind::Page => EntityKind::Page,
            ContentKind::File => EntityKind::File,
            ContentKind::Event => EntityKind::Event,
        }
    }

    pub fn id_prefix(&self) -> &'static str {
        self.entity_kind().as_str()
    }

    pub fn noun(&self) -> &'static str {
        match self {
            ContentKind::Post => "a post",
            ContentKind::Reply => "a reply",
            ContentKind::Bookmark => "a bookmark",
            ContentKind::Page => "a page",
            ContentKind::File => "a file",
            ContentKind::Event => "an event",
        }
    }
}

/// Post, Reply, Bookmark, Page, File or Event
///
/// Kind-specific fields (`startTime`, `mimeType`, ...) are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub actor_id: String,
    #[serde(flatten)]
    pub addressing: Addressing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "replyTo")]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub reaction_count: i64,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document for ContentObject {
    fn accepts(kind: EntityKind) -> bool {
        matches!(
            kind,
            EntityKind::Post
                | EntityKind::Reply
                | EntityKind::Bookmark
                | EntityKind::Page
                | EntityKind::File
                | EntityKind::Event
        )
    }
    fn kind(&self) -> EntityKind {
        self.kind.entity_kind()
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn owner(&self) -> &str {
        &self.actor_id
    }
}

/// One actor's reaction to one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct React {
    pub id: String,
    pub actor_id: String,
    pub target: String,
    #[serde(default = "default_reaction")]
    pub reaction: String,
    #[serde(flatten)]
    pub addressing: Addressing,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
}

single_kind_document!(React, EntityKind::React, actor_id);

fn default_reaction() -> String {
    "like".to_string()
}

impl React {
    /// One React per `(actor, target)`
    pub fn id_for(actor_id: &str, target: &str, domain: &str) -> String {
        EntityId::derived("react", domain, &[actor_id, target])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    /// Federation-native JSON
    Federation,
    /// RSS or Atom
    Syndication,
}

/// A followed remote source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feed {
    pub id: String,
    /// Remote actor publishing the feed
    pub actor_id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub format: FeedFormat,
    #[serde(flatten)]
    pub addressing: Addressing,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

single_kind_document!(Feed, EntityKind::Feed, actor_id);

impl Feed {
    /// Feeds are keyed by URL
    pub fn id_for(url: &str, domain: &str) -> String {
        EntityId::derived("feed", domain, &[url])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: String,
    pub feed_id: String,
    pub actor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reaction_count: i64,
    #[serde(flatten)]
    pub addressing: Addressing,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
}

single_kind_document!(FeedItem, EntityKind::FeedItem, actor_id);

impl FeedItem {
    /// Items are keyed by `(feed, item key)`
    pub fn id_for(feed_id: &str, item_key: &str, domain: &str) -> String {
        EntityId::derived("feeditem", domain, &[feed_id, item_key])
    }
}

/// Verbs understood by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Create,
    Update,
    Delete,
    Add,
    Remove,
    Approve,
    Reject,
    Join,
    Leave,
    Follow,
    Unfollow,
    #[serde(alias = "Like")]
    React,
    #[serde(alias = "Unlike")]
    Unreact,
    Block,
    Unblock,
    Mute,
    Unmute,
}

impl Verb {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "Create" => Verb::Create,
            "Update" => Verb::Update,
            "Delete" => Verb::Delete,
            "Add" => Verb::Add,
            "Remove" => Verb::Remove,
            "Approve" => Verb::Approve,
            "Reject" => Verb::Reject,
            "Join" => Verb::Join,
            "Leave" => Verb::Leave,
            "Follow" => Verb::Follow,
            "Unfollow" => Verb::Unfollow,
            "React" | "Like" => Verb::React,
            "Unreact" | "Unlike" => Verb::Unreact,
            "Block" => Verb::Block,
            "Unblock" => Verb::Unblock,
            "Mute" => Verb::Mute,
            "Unmute" => Verb::Unmute,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Create => "Create",
            Verb::Update => "Update",
            Verb::Delete => "Delete",
            Verb::Add => "Add",
            Verb::Remove => "Remove",
            Verb::Approve => "Approve",
            Verb::Reject => "Reject",
            Verb::Join => "Join",
            Verb::Leave => "Leave",
            Verb::Follow => "Follow",
            Verb::Unfollow => "Unfollow",
            Verb::React => "React",
            Verb::Unreact => "Unreact",
            Verb::Block => "Block",
            Verb::Unblock => "Unblock",
            Verb::Mute => "Mute",
            Verb::Unmute => "Unmute",
        }
    }
}

/// A dispatched activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    #[serde(rename = "type")]
    pub verb: Verb,
    pub actor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub addressing: Addressing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
}

single_kind_document!(Activity, EntityKind::Activity, actor_id);

/// JSON keys holding an entity's addressing
pub const ADDRESSING_FIELDS: [&str; 4] = ["to", "bto", "cc", "bcc"];

impl Activity {
    /// Rewrite the activity's addressing and the addressing embedded in `object`
    ///
    /// The embedded object is a snapshot of the created or patched entity and
    /// carries its own `bto`/`bcc`, so both must be scoped together.
    pub fn map_addressing(&mut self, f: impl Fn(&Addressing) -> Addressing) {
        self.addressing = f(&self.addressing);

        if let Some(Value::Object(fields)) = self.object.as_mut() {
            // unreadable addressing is dropped rather than passed through
            let inner: Addressing =
                serde_json::from_value(Value::Object(fields.clone())).unwrap_or_default();
            for key in ADDRESSING_FIELDS {
                fields.remove(key);
            }
            if let Ok(Value::Object(scoped)) = serde_json::to_value(f(&inner)) {
                fields.extend(scoped);
            }
        }
    }
}

/// Any stored entity, for verbs that act on whatever the target is
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    User(User),
    Circle(Circle),
    Group(Group),
    Content(ContentObject),
    React(React),
    Feed(Feed),
    FeedItem(FeedItem),
    Activity(Activity),
}

impl Entity {
    pub fn from_json(kind: EntityKind, body: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EntityKind::User => Entity::User(serde_json::from_value(body)?),
            EntityKind::Circle => Entity::Circle(serde_json::from_value(body)?),
            EntityKind::Group => Entity::Group(serde_json::from_value(body)?),
            EntityKind::React => Entity::React(serde_json::from_value(body)?),
            EntityKind::Feed => Entity::Feed(serde_json::from_value(body)?),
            EntityKind::FeedItem => Entity::FeedItem(serde_json::from_value(body)?),
            EntityKind::Activity => Entity::Activity(serde_json::from_value(body)?),
            EntityKind::Post
            | EntityKind::Reply
            | EntityKind::Bookmark
            | EntityKind::Page
            | EntityKind::File
            | EntityKind::Event => Entity::Content(serde_json::from_value(body)?),
        })
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            Entity::User(inner) => serde_json::to_value(inner),
            Entity::Circle(inner) => serde_json::to_value(inner),
            Entity::Group(inner) => serde_json::to_value(inner),
            Entity::Content(inner) => serde_json::to_value(inner),
            Entity::React(inner) => serde_json::to_value(inner),
            Entity::Feed(inner) => serde_json::to_value(inner),
            Entity::FeedItem(inner) => serde_json::to_value(inner),
            Entity::Activity(inner) => serde_json::to_value(inner),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::User(inner) => inner.kind(),
            Entity::Circle(inner) => inner.kind(),
            Entity::Group(inner) => inner.kind(),
            Entity::Content(inner) => inner.kind(),
            Entity::React(inner) => inner.kind(),
            Entity::Feed(inner) => inner.kind(),
            Entity::FeedItem(inner) => inner.kind(),
            Entity::Activity(inner) => inner.kind(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::User(inner) => &inner.id,
            Entity::Circle(inner) => &inner.id,
            Entity::Group(inner) => &inner.id,
            Entity::Content(inner) => &inner.id,
            Entity::React(inner) => &inner.id,
            Entity::Feed(inner) => &inner.id,
            Entity::FeedItem(inner) => &inner.id,
            Entity::Activity(inner) => &inner.id,
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            Entity::User(inner) => inner.owner(),
            Entity::Circle(inner) => inner.owner(),
            Entity::Group(inner) => inner.owner(),
            Entity::Content(inner) => inner.owner(),
            Entity::React(inner) => inner.owner(),
            Entity::Feed(inner) => inner.owner(),
            Entity::FeedItem(inner) => inner.owner(),
            Entity::Activity(inner) => inner.owner(),
        }
    }

    /// Owner, or a group admin for groups
    pub fn is_managed_by(&self, actor_id: &str) -> bool {
        match self {
            Entity::Group(group) => group.is_admin(actor_id),
            other => other.owner() == actor_id,
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        match self {
            Entity::User(inner) => &inner.lifecycle,
            Entity::Circle(inner) => &inner.lifecycle,
            Entity::Group(inner) => &inner.lifecycle,
            Entity::Content(inner) => &inner.lifecycle,
            Entity::React(inner) => &inner.lifecycle,
            Entity::Feed(inner) => &inner.lifecycle,
            Entity::FeedItem(inner) => &inner.lifecycle,
            Entity::Activity(inner) => &inner.lifecycle,
        }
    }

    pub fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        match self {
            Entity::User(inner) => &mut inner.lifecycle,
            Entity::Circle(inner) => &mut inner.lifecycle,
            Entity::Group(inner) => &mut inner.lifecycle,
            Entity::Content(inner) => &mut inner.lifecycle,
            Entity::React(inner) => &mut inner.lifecycle,
            Entity::Feed(inner) => &mut inner.lifecycle,
            Entity::FeedItem(inner) => &mut inner.lifecycle,
            Entity::Activity(inner) => &mut inner.lifecycle,
        }
    }

    /// Addressing, for entities that carry one. Users are always public.
    pub fn addressing(&self) -> Option<&Addressing> {
        match self {
            Entity::User(_) => None,
            Entity::Circle(inner) => Some(&inner.addressing),
            Entity::Group(inner) => Some(&inner.addressing),
            Entity::Content(inner) => Some(&inner.addressing),
            Entity::React(inner) => Some(&inner.addressing),
            Entity::Feed(inner) => Some(&inner.addressing),
            Entity::FeedItem(inner) => Some(&inner.addressing),
            Entity::Activity(inner) => Some(&inner.addressing),
        }
    }

    /// Counter maintained by React/Unreact
    pub fn reaction_count_mut(&mut self) -> Option<&mut i64> {
        match self {
            Entity::Content(inner) => Some(&mut inner.reaction_count),
            Entity::FeedItem(inner) => Some(&mut inner.reaction_count),
            _ => None,
        }
    }

    /// Name used in activity summaries
    pub fn display_name(&self) -> String {
        match self {
            Entity::User(user) => user.display_name().to_string(),
            Entity::Circle(circle) if !circle.name.is_empty() => circle.name.clone(),
            Entity::Group(group) if !group.name.is_empty() => group.name.clone(),
            Entity::Content(object) => object
                .name
                .clone()
                .unwrap_or_else(|| object.kind.noun().to_string()),
            Entity::Feed(feed) => feed.title.clone().unwrap_or_else(|| feed.url.clone()),
            Entity::FeedItem(item) => item.title.clone().unwrap_or_else(|| "a feed item".to_string()),
            Entity::Activity(activity) => format!("a {} activity", activity.verb.as_str()),
            other => other.id().to_string(),
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        match self {
            Entity::User(inner) => inner.updated_at = at,
            Entity::Circle(inner) => inner.updated_at = at,
            Entity::Group(inner) => inner.updated_at = at,
            Entity::Content(inner) => inner.updated_at = at,
            Entity::Feed(inner) => inner.updated_at = at,
            Entity::React(_) | Entity::FeedItem(_) | Entity::Activity(_) => {}
        }
    }
}

// =============================================================================
// Peers and queues
// =============================================================================

/// A remote (or the local) server
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub domain: String,
    pub public_key: Option<String>,
    pub follower_count: i64,
    pub reference_count: i64,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub backoff_secs: i64,
    pub error_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outbox item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Error,
}

/// Inbox item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Completed,
}

/// One activity bound for one peer domain
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OutboxItem {
    pub id: String,
    pub activity_id: String,
    pub domain: String,
    pub payload: sqlx::types::Json<Value>,
    pub status: DeliveryStatus,
    pub response: Option<String>,
    pub error: Option<String>,
    pub attempts: i64,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One activity received from a peer
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct InboxItem {
    pub id: String,
    pub server_domain: String,
    pub payload: sqlx::types::Json<Value>,
    pub status: ProcessingStatus,
    pub error: Option<String>,
    pub attempts: i64,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn domain_of_takes_text_after_last_at() {
        assert_eq!(domain_of("@alice@one.example"), Some("one.example"));
        assert_eq!(domain_of("circle:01abc@two.example"), Some("two.example"));
        assert_eq!(domain_of(PUBLIC), None);
        assert_eq!(domain_of("no-domain"), None);
    }

    #[test]
    fn addressing_accepts_single_id_or_list() {
        let addressing: Addressing =
            serde_json::from_value(json!({"to": "@public", "cc": ["@bob@b.example"]})).unwrap();
        assert!(addressing.to.contains(PUBLIC));
        assert!(addressing.cc.contains("@bob@b.example"));
        assert!(addressing.bcc.is_empty());
    }

    #[test]
    fn for_domain_keeps_only_blind_recipients_on_that_domain() {
        let addressing: Addressing = serde_json::from_value(json!({
            "to": ["@public"],
            "bcc": ["@bob@b.example", "@carol@c.example"]
        }))
        .unwrap();

        let scoped = addressing.for_domain("b.example");
        assert_eq!(scoped.bcc, BTreeSet::from(["@bob@b.example".to_string()]));
        assert_eq!(scoped.to, addressing.to);
    }

    #[test]
    fn members_decode_from_bare_ids() {
        let members: Vec<Member> =
            serde_json::from_value(json!(["@bob@a.example", {"id": "@carol@a.example"}])).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[1].id, "@carol@a.example");
    }

    #[test]
    fn lifecycle_serializes_as_tagged_state() {
        let deleted = Lifecycle::Deleted {
            at: Utc::now(),
            by: "@alice@a.example".to_string(),
        };
        let value = serde_json::to_value(&deleted).unwrap();
        assert_eq!(value["state"], "deleted");
        assert_eq!(value["by"], "@alice@a.example");
        let back: Lifecycle = serde_json::from_value(value).unwrap();
        assert_eq!(back, deleted);
    }

    #[test]
    fn derived_ids_are_stable() {
        let first = Feed::id_for("https://blog.example/rss", "a.example");
        let second = Feed::id_for("https://blog.example/rss", "a.example");
        assert_eq!(first, second);
        assert!(first.starts_with("feed:"));
        assert!(first.ends_with("@a.example"));
    }

    #[test]
    fn verb_parses_like_aliases() {
        assert_eq!(Verb::parse("Like"), Some(Verb::React));
        assert_eq!(Verb::parse("Unlike"), Some(Verb::Unreact));
        assert_eq!(Verb::parse("Poke"), None);
    }

    #[test]
    fn content_object_keeps_unknown_fields() {
        let object: ContentObject = serde_json::from_value(json!({
            "id": "event:1@a.example",
            "type": "Event",
            "actorId": "@alice@a.example",
            "startTime": "2026-01-01T10:00:00Z",
            "to": ["@public"],
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(object.extra.get("startTime"), Some(&json!("2026-01-01T10:00:00Z")));
        assert!(!object.extra.contains_key("to"));
    }
}
