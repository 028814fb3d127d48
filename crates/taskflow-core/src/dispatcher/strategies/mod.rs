//! One module per step kind, each implementing the activation rules its
//! kind specifies. Dispatched through a kind-keyed table rather than an
//! inheritance hierarchy.

pub mod agent;
pub mod decision;
pub mod external;
pub mod foreach;
pub mod join;
pub mod manual;
pub mod subflow;
pub mod trigger;
pub mod webhook;

use serde_json::Value;

/// Resolves a dot-separated path (`"items"`, `"payload.items"`, array
/// indices as plain numeric segments) against a JSON value. Returns `None`
/// if any segment is missing.
pub fn resolve_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = if let Ok(index) = segment.parse::<usize>() {
            current.as_array()?.get(index)?
        } else {
            current.as_object()?.get(segment)?
        };
    }
    Some(current.clone())
}

/// Whether a resolved JSON value counts as truthy for condition evaluation:
/// present, non-null, not `false`, not zero, not empty string/array/object.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_walks_nested_objects_and_arrays() {
        let value = serde_json::json!({"items": [{"id": 1}, {"id": 2}]});
        assert_eq!(resolve_path(&value, "items.1.id"), Some(serde_json::json!(2)));
        assert_eq!(resolve_path(&value, "items.5.id"), None);
    }

    #[test]
    fn truthiness_matches_common_sense() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&serde_json::json!(false)));
        assert!(!is_truthy(&serde_json::json!(0)));
        assert!(!is_truthy(&serde_json::json!("")));
        assert!(is_truthy(&serde_json::json!("ok")));
        assert!(is_truthy(&serde_json::json!(1)));
    }
}
