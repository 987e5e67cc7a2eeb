//! Flattens arbitrary records into a single embedding text.

use serde_json::Value;

use crate::document::scalar_text;

/// Keys that carry internal identifiers rather than meaning.
const NOISE_KEYS: [&str; 3] = ["id", "uuid", "_id"];

/// Atoms that are dropped from the text.
const EMPTY_ATOMS: [&str; 3] = ["", " ", "null"];

/// Walks `record` depth-first, emitting key names (minus id noise) and
/// non-empty atomic values, then collapses whitespace.
pub fn unify_text(record: &Value) -> String {
    let mut parts = Vec::new();
    collect_parts(record, &mut parts);
    parts
        .iter()
        .flat_map(|part| part.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

fn collect_parts(value: &Value, parts: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if !is_noise_key(key) {
                    parts.push(key.clone());
                }
                collect_parts(child, parts);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_parts(item, parts);
            }
        }
        Value::Null => {}
        atom => {
            let text = scalar_text(atom);
            if !EMPTY_ATOMS.contains(&text.as_str()) {
                parts.push(text);
            }
        }
    }
}

fn is_noise_key(key: &str) -> bool {
    NOISE_KEYS
        .iter()
        .any(|noise| key.eq_ignore_ascii_case(noise))
}
