//! Outbound payload sanitizer.
//!
//! Every payload leaving the hub passes through [`sanitize`], which
//! strips credential-bearing fields wherever they appear in the value
//! tree. Field names are matched exactly.

use serde_json::Value;

/// Field names never allowed on the wire
const BLOCKED_FIELDS: &[&str] = &["password", "token", "secret", "apiKey", "privateKey"];

/// Remove blocked fields from a JSON value, recursively
pub fn sanitize(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !BLOCKED_FIELDS.contains(&key.as_str()));
            for (_, nested) in map.iter_mut() {
                sanitize(nested);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                sanitize(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_top_level_fields() {
        let mut value = json!({"name": "alice", "password": "hunter2", "token": "t"});
        sanitize(&mut value);
        assert_eq!(value, json!({"name": "alice"}));
    }

    #[test]
    fn strips_nested_and_array_fields() {
        let mut value = json!({
            "agents": [
                {"id": 1, "apiKey": "k", "profile": {"privateKey": "p", "ext": "1001"}}
            ]
        });
        sanitize(&mut value);
        assert_eq!(value, json!({"agents": [{"id": 1, "profile": {"ext": "1001"}}]}));
    }

    #[test]
    fn leaves_scalars_untouched() {
        let mut value = json!("password");
        sanitize(&mut value);
        assert_eq!(value, json!("password"));
    }
}
