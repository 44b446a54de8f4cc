//! Canonical JSON encoding.
//!
//! Every hash input in the ledger core — event hashes, delta checksums,
//! vault markers — is computed over the *canonical* byte encoding of a
//! JSON value, never over whatever a serializer happened to produce. This
//! crate is the single place that encoding is defined:
//!
//! - object keys are sorted lexicographically, recursively
//! - arrays keep their original order
//! - there is no insignificant whitespace
//! - non-finite numbers (`NaN`, `Infinity`) are rejected
//!
//! ```
//! use ledgercore_atom::canonicalize;
//! use serde_json::json;
//!
//! let data = json!({"z": 1, "a": 2});
//! let canonical = canonicalize(&data).unwrap();
//! assert_eq!(canonical, br#"{"a":2,"z":1}"#);
//! ```

#![deny(unsafe_code)]

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur during canonicalization.
#[derive(Error, Debug)]
pub enum AtomError {
    /// JSON serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A non-finite number (NaN or Infinity) was present.
    #[error("non-finite number detected")]
    NonFiniteNumber,
}

/// Result type for atom operations.
pub type Result<T> = std::result::Result<T, AtomError>;

/// Canonicalize a JSON value to deterministic bytes.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>> {
    let sorted = sort_keys_recursive(value)?;
    Ok(serde_json::to_vec(&sorted)?)
}

/// Canonicalize to a UTF-8 string, for logging and tests.
pub fn canonicalize_string(value: &Value) -> Result<String> {
    let bytes = canonicalize(value)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// `BLAKE3(canonical_bytes)`, hex-encoded. Used wherever a payload needs a
/// content-addressed identity independent of hash-chain position (atom
/// hashes, vault-marker content checks).
pub fn content_hash(value: &Value) -> Result<String> {
    let canonical = canonicalize(value)?;
    Ok(hex::encode(blake3::hash(&canonical).as_bytes()))
}

fn sort_keys_recursive(value: &Value) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut sorted_map = Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                let val = map.get(key).unwrap();
                sorted_map.insert(key.clone(), sort_keys_recursive(val)?);
            }
            Ok(Value::Object(sorted_map))
        }
        Value::Array(arr) => {
            let sorted: Result<Vec<Value>> = arr.iter().map(sort_keys_recursive).collect();
            Ok(Value::Array(sorted?))
        }
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if f.is_nan() || f.is_infinite() {
                    return Err(AtomError::NonFiniteNumber);
                }
            }
            Ok(value.clone())
        }
        _ => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys() {
        let data = json!({"z": 1, "a": 2, "m": 3});
        assert_eq!(canonicalize_string(&data).unwrap(), r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn sorts_nested_keys() {
        let data = json!({"outer": {"z": 1, "a": 2}, "array": [{"b": 1, "a": 2}]});
        assert_eq!(
            canonicalize_string(&data).unwrap(),
            r#"{"array":[{"a":2,"b":1}],"outer":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn preserves_array_order() {
        let data = json!([3, 1, 2]);
        assert_eq!(canonicalize_string(&data).unwrap(), "[3,1,2]");
    }

    #[test]
    fn deterministic_regardless_of_insertion_order() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
    }

    #[test]
    fn no_whitespace() {
        let data = json!({"key": "value", "nested": {"a": 1}});
        let canon = canonicalize_string(&data).unwrap();
        assert!(!canon.contains(' '));
        assert!(!canon.contains('\n'));
    }

    #[test]
    fn content_hash_matches_raw_blake3() {
        let v = json!({"a": 1, "b": [2, 3]});
        let h = content_hash(&v).unwrap();
        let canon = canonicalize(&v).unwrap();
        assert_eq!(h, hex::encode(blake3::hash(&canon).as_bytes()));
    }

    #[test]
    fn content_hash_deterministic() {
        let v1 = json!({"z": 1, "a": 2});
        let v2 = json!({"a": 2, "z": 1});
        assert_eq!(content_hash(&v1).unwrap(), content_hash(&v2).unwrap());
    }
}
