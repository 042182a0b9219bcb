//! Activity envelope validation
//!
//! The wire envelope is read loosely, checked against per-verb field rules
//! and then decoded into a [`Command`], one payload shape per verb.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::data::{Addressing, Verb};
use crate::error::AppError;

/// Submitted activity, as received
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Present on activities relayed by a peer
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub verb: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub object: Option<Value>,
    #[serde(default)]
    pub target: Option<Value>,
    #[serde(flatten)]
    pub addressing: Addressing,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Read an envelope from a request body
    ///
    /// # Errors
    /// `InvalidActivity` when the body is not an object or a field has the
    /// wrong JSON type
    pub fn from_json(body: Value) -> Result<Self, AppError> {
        if !body.is_object() {
            return Err(AppError::InvalidActivity(vec![
                "activity must be a JSON object".to_string(),
            ]));
        }
        serde_json::from_value(body).map_err(|e| AppError::InvalidActivity(vec![e.to_string()]))
    }

    /// Self-registration: the only activity accepted without authentication
    pub fn is_signup(&self) -> bool {
        self.verb.as_deref() == Some("Create") && self.object_type.as_deref() == Some("User")
    }

    pub fn actor(&self) -> &str {
        self.actor_id.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

const TARGET_REQUIRED: &[Verb] = &[
    Verb::Add,
    Verb::Approve,
    Verb::Block,
    Verb::Delete,
    Verb::Join,
    Verb::Leave,
    Verb::Mute,
    Verb::Remove,
    Verb::Update,
];

const OBJECT_REQUIRED: &[Verb] = &[
    Verb::Add,
    Verb::Approve,
    Verb::Create,
    Verb::Reject,
    Verb::Update,
];

/// Verbs whose actor must already have a user record here
pub const LOCAL_ACTOR_VERBS: &[Verb] = &[
    Verb::Add,
    Verb::Approve,
    Verb::Block,
    Verb::Delete,
    Verb::Update,
    Verb::Join,
    Verb::Leave,
    Verb::Mute,
    Verb::Reject,
    Verb::Remove,
    Verb::Unblock,
    Verb::Unmute,
];

fn present(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.trim().is_empty())
}

/// Check required fields
///
/// Collects every problem rather than stopping at the first.
pub fn validate(envelope: &Envelope) -> ValidationReport {
    let mut errors = Vec::new();

    if !non_empty(&envelope.actor_id) {
        errors.push("actorId is required".to_string());
    }

    let verb = match envelope.verb.as_deref().map(str::trim) {
        None | Some("") => {
            errors.push("type is required".to_string());
            return ValidationReport::from_errors(errors);
        }
        Some(name) => match Verb::parse(name) {
            Some(verb) => verb,
            None => {
                errors.push(format!("unknown activity type: {}", name));
                return ValidationReport::from_errors(errors);
            }
        },
    };

    if TARGET_REQUIRED.contains(&verb) && !present(&envelope.target) {
        errors.push(format!("target is required for {}", verb.as_str()));
    }
    if OBJECT_REQUIRED.contains(&verb) && !present(&envelope.object) {
        errors.push(format!("object is required for {}", verb.as_str()));
    }
    if verb == Verb::Create && !non_empty(&envelope.object_type) {
        errors.push("objectType is required for Create".to_string());
    }

    ValidationReport::from_errors(errors)
}

/// Verb payloads
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Create {
        object_type: String,
        object: Map<String, Value>,
    },
    Update {
        target: String,
        patch: Map<String, Value>,
    },
    Delete {
        target: String,
    },
    Add {
        target: String,
        member: String,
    },
    Remove {
        target: String,
        member: String,
    },
    Approve {
        group: String,
        member: String,
    },
    Reject {
        group: String,
        member: String,
    },
    Join {
        group: String,
    },
    Leave {
        group: String,
    },
    Follow {
        target: String,
    },
    Unfollow {
        target: String,
    },
    React {
        target: String,
        reaction: String,
    },
    Unreact {
        target: String,
    },
    Block {
        target: String,
    },
    Unblock {
        target: String,
    },
    Mute {
        target: String,
    },
    Unmute {
        target: String,
    },
}

impl Command {
    pub fn verb(&self) -> Verb {
        match self {
            Command::Create { .. } => Verb::Create,
            Command::Update { .. } => Verb::Update,
            Command::Delete { .. } => Verb::Delete,
            Command::Add { .. } => Verb::Add,
            Command::Remove { .. } => Verb::Remove,
            Command::Approve { .. } => Verb::Approve,
            Command::Reject { .. } => Verb::Reject,
            Command::Join { .. } => Verb::Join,
            Command::Leave { .. } => Verb::Leave,
            Command::Follow { .. } => Verb::Follow,
            Command::Unfollow { .. } => Verb::Unfollow,
            Command::React { .. } => Verb::React,
            Command::Unreact { .. } => Verb::Unreact,
            Command::Block { .. } => Verb::Block,
            Command::Unblock { .. } => Verb::Unblock,
            Command::Mute { .. } => Verb::Mute,
            Command::Unmute { .. } => Verb::Unmute,
        }
    }

    /// Id the verb acts on, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            Command::Create { .. } => None,
            Command::Approve { group, .. }
            | Command::Reject { group, .. }
            | Command::Join { group }
            | Command::Leave { group } => Some(group),
            Command::Update { target, .. }
            | Command::Delete { target }
            | Command::Add { target, .. }
            | Command::Remove { target, .. }
            | Command::Follow { target }
            | Command::Unfollow { target }
            | Command::React { target, .. }
            | Command::Unreact { target }
            | Command::Block { target }
            | Command::Unblock { target }
            | Command::Mute { target }
            | Command::Unmute { target } => Some(target),
        }
    }
}

/// Id carried by a field that may be a bare id or an object with an `id`
fn id_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) => Some(id.trim().to_string()).filter(|id| !id.is_empty()),
        Value::Object(map) => id_of(map.get("id")),
        _ => None,
    }
}

/// Member id in an Add/Remove/Approve/Reject object
fn member_of(object: Option<&Value>) -> Option<String> {
    match object? {
        Value::Object(map) => id_of(map.get("actorId")).or_else(|| id_of(map.get("id"))),
        other => id_of(Some(other)),
    }
}

/// Validate and decode
///
/// # Errors
/// - `UnknownVerb` for an unrecognized `type`
/// - `InvalidActivity` with every problem found otherwise
pub fn decode(envelope: &Envelope) -> Result<Command, AppError> {
    if let Some(name) = envelope.verb.as_deref().map(str::trim) {
        if !name.is_empty() && Verb::parse(name).is_none() {
            return Err(AppError::UnknownVerb(name.to_string()));
        }
    }

    let report = validate(envelope);
    if !report.valid {
        return Err(AppError::InvalidActivity(report.errors));
    }

    // validate() guarantees a known verb
    let verb = envelope
        .verb
        .as_deref()
        .and_then(|name| Verb::parse(name.trim()))
        .ok_or_else(|| AppError::InvalidActivity(vec!["type is required".to_string()]))?;

    let object = envelope.object.as_ref();
    let target = id_of(envelope.target.as_ref());
    let missing = |what: &str| AppError::InvalidActivity(vec![format!(
        "{} is required for {}",
        what,
        verb.as_str()
    )]);
    let object_map = || match object {
        Some(Value::Object(map)) => Ok(map.clone()),
        _ => Err(AppError::InvalidActivity(vec![format!(
            "object must be a JSON object for {}",
            verb.as_str()
        )])),
    };
    let required_target = || target.clone().ok_or_else(|| missing("target"));
    let target_or_object = || {
        target
            .clone()
            .or_else(|| id_of(object))
            .ok_or_else(|| missing("target"))
    };

    Ok(match verb {
        Verb::Create => Command::Create {
            object_type: envelope
                .object_type
                .clone()
                .unwrap_or_default()
                .trim()
                .to_string(),
            object: object_map()?,
        },
        Verb::Update => Command::Update {
            target: required_target()?,
            patch: object_map()?,
        },
        Verb::Delete => Command::Delete {
            target: required_target()?,
        },
        Verb::Add | Verb::Remove => {
            let target = required_target()?;
            let member = member_of(object).ok_or_else(|| missing("object"))?;
            if verb == Verb::Add {
                Command::Add { target, member }
            } else {
                Command::Remove { target, member }
            }
        }
        Verb::Approve => Command::Approve {
            group: required_target()?,
            member: member_of(object).ok_or_else(|| missing("object"))?,
        },
        Verb::Reject => {
            let from_object = |key: &str| match object {
                Some(Value::Object(map)) => id_of(map.get(key)),
                _ => None,
            };
            Command::Reject {
                group: target
                    .clone()
                    .or_else(|| from_object("group"))
                    .or_else(|| from_object("target"))
                    .ok_or_else(|| missing("target"))?,
                member: member_of(object).ok_or_else(|| missing("object"))?,
            }
        }
        Verb::Join => Command::Join {
            group: required_target()?,
        },
        Verb::Leave => Command::Leave {
            group: required_target()?,
        },
        Verb::Follow => Command::Follow {
            target: target_or_object()?,
        },
        Verb::Unfollow => Command::Unfollow {
            target: target_or_object()?,
        },
        Verb::React => Command::React {
            target: target_or_object()?,
            reaction: match object {
                Some(Value::Object(map)) => map.get("reaction").and_then(Value::as_str),
                _ => None,
            }
            .map(str::to_string)
            .unwrap_or_else(|| "like".to_string()),
        },
        Verb::Unreact => Command::Unreact {
            target: target_or_object()?,
        },
        Verb::Block => Command::Block {
            target: required_target()?,
        },
        Verb::Unblock => Command::Unblock {
            target: target_or_object()?,
        },
        Verb::Mute => Command::Mute {
            target: required_target()?,
        },
        Verb::Unmute => Command::Unmute {
            target: target_or_object()?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: Value) -> Envelope {
        Envelope::from_json(value).unwrap()
    }

    #[test]
    fn test_missing_actor_and_type() {
        let report = validate(&envelope(json!({})));
        assert!(!report.valid);
        assert_eq!(
            report.errors,
            vec!["actorId is required".to_string(), "type is required".to_string()]
        );
    }

    #[test]
    fn test_create_requires_object_and_object_type() {
        let report = validate(&envelope(json!({
            "type": "Create",
            "actorId": "@alice@a.example"
        })));
        assert!(!report.valid);
        assert!(report.errors.contains(&"object is required for Create".to_string()));
        assert!(report.errors.contains(&"objectType is required for Create".to_string()));
    }

    #[test]
    fn test_target_rules() {
        for verb in ["Add", "Approve", "Block", "Delete", "Join", "Leave", "Mute", "Remove", "Update"] {
            let report = validate(&envelope(json!({
                "type": verb,
                "actorId": "@alice@a.example",
                "object": {"id": "x"}
            })));
            assert!(
                report.errors.contains(&format!("target is required for {}", verb)),
                "{verb} should require a target"
            );
        }

        let report = validate(&envelope(json!({
            "type": "Unblock",
            "actorId": "@alice@a.example"
        })));
        assert!(report.valid);
    }

    #[test]
    fn test_unknown_verb_is_rejected_before_field_rules() {
        let result = decode(&envelope(json!({"type": "Poke", "actorId": "@a@a.example"})));
        assert!(matches!(result, Err(AppError::UnknownVerb(name)) if name == "Poke"));
    }

    #[test]
    fn test_invalid_json_shape() {
        assert!(matches!(
            Envelope::from_json(json!(["not", "an", "object"])),
            Err(AppError::InvalidActivity(_))
        ));
        assert!(matches!(
            Envelope::from_json(json!({"type": 42})),
            Err(AppError::InvalidActivity(_))
        ));
    }

    #[test]
    fn test_decode_create() {
        let command = decode(&envelope(json!({
            "type": "Create",
            "actorId": "@alice@a.example",
            "objectType": "Note",
            "object": {"content": "hi"},
            "to": "@public"
        })))
        .unwrap();

        match command {
            Command::Create { object_type, object } => {
                assert_eq!(object_type, "Note");
                assert_eq!(object.get("content"), Some(&json!("hi")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_decode_create_rejects_string_object() {
        let result = decode(&envelope(json!({
            "type": "Create",
            "actorId": "@alice@a.example",
            "objectType": "Note",
            "object": "post:1@a.example"
        })));
        assert!(matches!(result, Err(AppError::InvalidActivity(_))));
    }

    #[test]
    fn test_decode_member_from_string_or_object() {
        let add = decode(&envelope(json!({
            "type": "Add",
            "actorId": "@alice@a.example",
            "target": "circle:1@a.example",
            "object": "@bob@b.example"
        })))
        .unwrap();
        assert_eq!(
            add,
            Command::Add {
                target: "circle:1@a.example".to_string(),
                member: "@bob@b.example".to_string()
            }
        );

        let remove = decode(&envelope(json!({
            "type": "Remove",
            "actorId": "@alice@a.example",
            "target": {"id": "circle:1@a.example"},
            "object": {"actorId": "@bob@b.example"}
        })))
        .unwrap();
        assert_eq!(
            remove,
            Command::Remove {
                target: "circle:1@a.example".to_string(),
                member: "@bob@b.example".to_string()
            }
        );
    }

    #[test]
    fn test_decode_reject_reads_group_from_object() {
        let command = decode(&envelope(json!({
            "type": "Reject",
            "actorId": "@alice@a.example",
            "object": {"actorId": "@bob@b.example", "group": "group:1@a.example"}
        })))
        .unwrap();
        assert_eq!(
            command,
            Command::Reject {
                group: "group:1@a.example".to_string(),
                member: "@bob@b.example".to_string()
            }
        );
    }

    #[test]
    fn test_decode_like_alias_and_reaction() {
        let command = decode(&envelope(json!({
            "type": "Like",
            "actorId": "@alice@a.example",
            "object": {"id": "post:1@a.example", "reaction": "heart"}
        })))
        .unwrap();
        assert_eq!(
            command,
            Command::React {
                target: "post:1@a.example".to_string(),
                reaction: "heart".to_string()
            }
        );
    }

    #[test]
    fn test_signup_detection() {
        assert!(envelope(json!({"type": "Create", "objectType": "User"})).is_signup());
        assert!(!envelope(json!({"type": "Create", "objectType": "Note"})).is_signup());
    }
}
