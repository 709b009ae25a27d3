//! Canonical JSON serialization and hashing.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::IntegrityError;
use crate::seal::INTEGRITY_HASH_FIELD;

/// Serializes `value` as compact JSON with object keys sorted at every depth.
///
/// Keys compare by UTF-8 bytes, which matches code point order. Numbers and
/// strings use `serde_json`'s own formatting, so escaping is stable.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 over the canonical JSON of `value`.
///
/// A top-level `integrity_hash` field is excluded so a sealed record can be
/// rehashed as-is.
pub fn canonical_hash(value: &Value) -> [u8; 32] {
    let json = match value {
        Value::Object(map) if map.contains_key(INTEGRITY_HASH_FIELD) => {
            let mut stripped = map.clone();
            stripped.remove(INTEGRITY_HASH_FIELD);
            canonical_json(&Value::Object(stripped))
        }
        other => canonical_json(other),
    };

    Sha256::digest(json.as_bytes()).into()
}

/// Lowercase hex form of [`canonical_hash`].
pub fn canonical_hash_hex(value: &Value) -> String {
    hex::encode(canonical_hash(value))
}

/// Hashes any serializable value through its JSON form.
///
/// # Errors
///
/// Returns [`IntegrityError::Serialization`] if `value` cannot be
/// represented as JSON (e.g. a map with non-string keys).
pub fn canonical_hash_of<T: Serialize + ?Sized>(value: &T) -> Result<[u8; 32], IntegrityError> {
    Ok(canonical_hash(&serde_json::to_value(value)?))
}
