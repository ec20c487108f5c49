//! Normalization of loosely-typed model output into plain strings.
//!
//! Models asked for a string field sometimes answer with an object
//! (`{"name": ...}`, `{"text": ...}`) or a list. This is the only place such
//! values are accepted; everything past the capability boundary is `String`.

use serde_json::Value;

/// `AnyOf(string, mapping, list, scalar, null) -> string`.
///
/// - strings pass through unchanged
/// - mappings resolve `name`, then `text`, else their compact JSON rendering
/// - lists join their coerced, non-empty elements with `", "`
/// - numbers and booleans use their JSON rendering
/// - null becomes the empty string
pub fn coerce_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Object(map) => map
            .get("name")
            .or_else(|| map.get("text"))
            .map(coerce_text)
            .unwrap_or_else(|| value.to_string()),
        Value::Array(items) => items
            .iter()
            .map(coerce_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
    }
}

/// Coerce an optional field, treating absence like null.
pub fn coerce_opt(value: Option<&Value>) -> String {
    value.map(coerce_text).unwrap_or_default()
}

/// Coerce a field that should be a list of strings. A bare string becomes a
/// one-element list; empty entries are dropped.
pub fn coerce_list(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(coerce_text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(other) => {
            let s = coerce_text(other).trim().to_string();
            if s.is_empty() {
                Vec::new()
            } else {
                vec![s]
            }
        }
    }
}
