//! Update patches
//!
//! Top-level fields are replaced. Fields holding objects on both sides are
//! merged one level deep, so `{profile: {bio}}` keeps the other profile keys.

use serde_json::{Map, Value};

/// Never changed by an Update
pub const IMMUTABLE_FIELDS: &[&str] = &[
    "id",
    "type",
    "actorId",
    "username",
    "publicKey",
    "privateKey",
    "lifecycle",
    "signature",
    "createdAt",
    "updatedAt",
    "reactionCount",
    "following",
    "blocked",
    "muted",
    "feedId",
    "target",
];

/// Only changed by an admin
pub const ADMIN_FIELDS: &[&str] = &["isAdmin"];

/// Apply `patch` to `current`. Returns the names of ignored fields.
pub fn merge_patch(
    current: &mut Map<String, Value>,
    patch: &Map<String, Value>,
    by_admin: bool,
) -> Vec<String> {
    let mut ignored = Vec::new();

    for (key, value) in patch {
        let key_str = key.as_str();
        if IMMUTABLE_FIELDS.contains(&key_str) || (!by_admin && ADMIN_FIELDS.contains(&key_str)) {
            ignored.push(key.clone());
            continue;
        }

        match (current.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (inner_key, inner_value) in incoming {
                    existing.insert(inner_key.clone(), inner_value.clone());
                }
            }
            _ => {
                current.insert(key.clone(), value.clone());
            }
        }
    }

    ignored
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_nested_objects_keep_other_keys() {
        let mut current = map(json!({"profile": {"name": "A"}, "email": "a@x"}));
        merge_patch(&mut current, &map(json!({"profile": {"bio": "x"}})), false);
        assert_eq!(current["profile"], json!({"name": "A", "bio": "x"}));
        assert_eq!(current["email"], json!("a@x"));
    }

    #[test]
    fn test_scalars_and_arrays_are_replaced() {
        let mut current = map(json!({"content": "old", "tags": ["a", "b"]}));
        merge_patch(&mut current, &map(json!({"content": "new", "tags": ["c"]})), false);
        assert_eq!(current["content"], json!("new"));
        assert_eq!(current["tags"], json!(["c"]));
    }

    #[test]
    fn test_immutable_fields_are_ignored() {
        let mut current = map(json!({"id": "post:1@a.example", "actorId": "@alice@a.example"}));
        let mut ignored = merge_patch(
            &mut current,
            &map(json!({"id": "post:2@a.example", "actorId": "@mallory@a.example", "name": "n"})),
            false,
        );
        assert_eq!(current["id"], json!("post:1@a.example"));
        assert_eq!(current["actorId"], json!("@alice@a.example"));
        assert_eq!(current["name"], json!("n"));
        ignored.sort();
        assert_eq!(ignored, vec!["actorId".to_string(), "id".to_string()]);
    }

    #[test]
    fn test_admin_fields_need_an_admin() {
        let mut current = map(json!({"isAdmin": false}));
        merge_patch(&mut current, &map(json!({"isAdmin": true})), false);
        assert_eq!(current["isAdmin"], json!(false));
        merge_patch(&mut current, &map(json!({"isAdmin": true})), true);
        assert_eq!(current["isAdmin"], json!(true));
    }
}
