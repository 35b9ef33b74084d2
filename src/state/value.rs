//! Deep-merge and structural-equality operators over `serde_json::Value`
//!. Pure functions, no I/O — the concurrency contract lives in
//! `service.rs`.

use serde_json::{Map, Value};

/// Recursively overlay `incoming` onto `existing`.
///
/// Both operands must be objects for a field-wise recursive merge to apply;
/// otherwise (arrays, scalars, a type mismatch between the two sides, or
/// either side missing) `incoming` simply replaces `existing` at that
/// position. This matches the wire contract exactly: devices send partial
/// updates expecting fields they didn't mention to survive, but arrays are
/// always replaced atomically, never merged element-wise.
pub fn merge_values(existing: &Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Object(existing_map), Value::Object(incoming_map)) => {
            let mut merged = existing_map.clone();
            for (key, incoming_value) in incoming_map {
                match merged.get(key) {
                    Some(existing_value) => {
                        let merged_value = merge_values(existing_value, incoming_value);
                        merged.insert(key.clone(), merged_value);
                    }
                    None => {
                        merged.insert(key.clone(), incoming_value.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        _ => incoming.clone(),
    }
}

/// Structural equality independent of object key insertion order.
/// `serde_json::Value`'s `PartialEq` already treats `Map` as order-independent
/// (it's a `BTreeMap`/`IndexMap` compared by key-value pairs, not Vec order),
/// but we keep this as an explicit named entry point so callers never reach
/// for a string/toString comparison by mistake.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    a == b
}

/// Apply `preserved_keys` from `prior` onto `merged` wherever `merged` is
/// missing that key — used by fan-timer preservation and similar
/// omitted-field-survives rules in `derive.rs`. `merged` must be an object;
/// if it isn't, it's returned unchanged.
pub fn preserve_missing_keys(merged: Value, prior: &Value, preserved_keys: &[&str]) -> Value {
    let (Value::Object(mut merged_map), Value::Object(prior_map)) = (merged.clone(), prior) else {
        return merged;
    };
    for key in preserved_keys {
        if !merged_map.contains_key(*key) {
            if let Some(prior_value) = prior_map.get(*key) {
                merged_map.insert((*key).to_string(), prior_value.clone());
            }
        }
    }
    Value::Object(merged_map)
}

pub fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_recurses_into_nested_objects() {
        let existing = json!({"a": {"x": 1, "y": 2}, "b": 3});
        let incoming = json!({"a": {"y": 99}});
        let merged = merge_values(&existing, &incoming);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 99}, "b": 3}));
    }

    #[test]
    fn merge_replaces_arrays_atomically() {
        let existing = json!({"list": [1, 2, 3]});
        let incoming = json!({"list": [9]});
        let merged = merge_values(&existing, &incoming);
        assert_eq!(merged, json!({"list": [9]}));
    }

    #[test]
    fn merge_keeps_fields_incoming_omits() {
        let existing = json!({"away": false, "postal_code": "94107"});
        let incoming = json!({"away": true});
        let merged = merge_values(&existing, &incoming);
        assert_eq!(merged, json!({"away": true, "postal_code": "94107"}));
    }

    #[test]
    fn equality_ignores_key_order() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert!(values_equal(&a, &b));
    }

    #[test]
    fn preserve_missing_keys_restores_omitted_fan_fields() {
        let prior = json!({
            "fan_timer_timeout": 900,
            "fan_mode": "auto",
            "away": false
        });
        let merged = json!({"away": true});
        let result = preserve_missing_keys(
            merged,
            &prior,
            &["fan_timer_timeout", "fan_mode", "fan_control_state"],
        );
        assert_eq!(
            result,
            json!({"away": true, "fan_timer_timeout": 900, "fan_mode": "auto"})
        );
    }

    #[test]
    fn preserve_missing_keys_does_not_overwrite_present_fields() {
        let prior = json!({"fan_mode": "auto"});
        let merged = json!({"fan_mode": "off"});
        let result = preserve_missing_keys(merged, &prior, &["fan_mode"]);
        assert_eq!(result, json!({"fan_mode": "off"}));
    }
}
