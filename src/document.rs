//! Accessors over schema-less source records.
//!
//! Records are kept as opaque [`serde_json::Value`] documents. Every helper in
//! this module is total: malformed or unexpected shapes produce `None` rather
//! than an error.

use serde_json::Value;

/// Compact serialization with object keys in sorted order.
///
/// `serde_json` stores objects in a `BTreeMap` (the `preserve_order` feature
/// is not enabled), so plain serialization is already key-sorted at every
/// nesting level.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Depth-first, case-insensitive search for `field`.
///
/// Keys of an object are checked before any of its children are visited. A
/// matching key holding a string or number yields that value; a matching key
/// holding an object or array is searched in turn. Empty strings count as
/// absent so the search continues elsewhere.
pub fn find_field(value: &Value, field: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if !key.eq_ignore_ascii_case(field) {
                    continue;
                }
                match child {
                    Value::String(text) if !text.trim().is_empty() => {
                        return Some(text.trim().to_string());
                    }
                    Value::Number(number) => return Some(number.to_string()),
                    Value::Object(_) | Value::Array(_) => {
                        if let Some(found) = find_field(child, field) {
                            return Some(found);
                        }
                    }
                    _ => {}
                }
            }
            map.values().find_map(|child| find_field(child, field))
        }
        Value::Array(items) => items.iter().find_map(|item| find_field(item, field)),
        _ => None,
    }
}

/// Truthiness as understood by the deduplication key: `null`, `false`, `0`,
/// empty strings and empty containers are all "not present".
pub fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Renders a scalar the way it should appear in keys and text: strings
/// without quotes, everything else as JSON.
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
