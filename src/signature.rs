//! Signature derivation
//!
//! Two submissions with the same signature are the same logical screenshot.
//! The signature folds in only the properties named by the configured key
//! list, in list order, so it is stable across processes and map iteration
//! orders.

use serde_json::Value;
use std::collections::BTreeMap;

/// Derives the signature for `(name, properties)` under an ordered key list.
pub fn derive_signature(
    name: &str,
    properties: &BTreeMap<String, Value>,
    signature_keys: &[String],
) -> String {
    let mut signature = String::from(name);
    for key in signature_keys {
        signature.push('|');
        if let Some(value) = properties.get(key) {
            signature.push_str(&canonical_value(value));
        }
    }
    signature
}

/// Canonical string form of a property value: booleans as `true`/`false`,
/// numbers in shortest round-trip form, strings verbatim.
fn canonical_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                // serde_json's f64 Display is already shortest round-trip
                n.to_string()
            }
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// File-name-safe encoding of a signature: separators and traversal
/// components collapse to `-`.
pub fn signature_key(signature: &str) -> String {
    signature
        .replace("..", "-")
        .chars()
        .map(|c| match c {
            '/' | '\\' => '-',
            c => c,
        })
        .collect()
}
