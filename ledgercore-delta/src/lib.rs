//! Object diff, delta application, and state reconstruction.
//!
//! This is the replay half of the integrity pipeline: [`delta`] compresses
//! an update into a compact per-field record, [`apply`] replays one such
//! record (or a full snapshot) onto a state value, and [`reconstruct`] folds
//! a whole ordered history. `reconstruct` is the authoritative function
//! forensic tooling uses to recover an entity's current state from nothing
//! but its ledger history — it must never diverge from what the live write
//! path produces.

#![deny(unsafe_code)]

use ledgercore_atom::canonicalize;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from delta operations.
#[derive(Error, Debug)]
pub enum DeltaError {
    /// A value could not be canonicalized to compare or checksum it.
    #[error("failed to canonicalize value: {0}")]
    Canonicalize(#[from] ledgercore_atom::AtomError),

    /// `apply` was given a delta payload missing its `diff` object.
    #[error("delta payload is missing a `diff` object")]
    MissingDiff,
}

/// Result type for delta operations.
pub type Result<T> = std::result::Result<T, DeltaError>;

/// A single field's before/after value, as recorded by [`delta`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDelta {
    /// The field's value before the mutation.
    pub from: Value,
    /// The field's value after the mutation.
    pub to: Value,
}

/// A per-field diff between two object states, keyed by field name.
pub type Diff = BTreeMap<String, FieldDelta>;

/// Keys excluded from diffing: bookkeeping fields (`__`-prefixed) and
/// auto-maintained timestamps, neither of which represent a semantic
/// change worth recording in the ledger.
fn is_excluded_key(key: &str) -> bool {
    key.starts_with("__") || key == "createdAt" || key == "updatedAt"
}

/// Compute the shallow field-level diff between `old` and `new`.
///
/// Only top-level keys are compared; a field whose canonical encoding is
/// unchanged is omitted from the result even if the two `Value`s are not
/// byte-identical (e.g. `1` vs `1.0` which canonicalize the same way).
pub fn delta(old: &Value, new: &Value) -> Result<Diff> {
    let old_map = as_object(old);
    let new_map = as_object(new);

    let mut keys: Vec<&String> = old_map.keys().chain(new_map.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut out = Diff::new();
    for key in keys {
        if is_excluded_key(key) {
            continue;
        }
        let old_val = old_map.get(key).cloned().unwrap_or(Value::Null);
        let new_val = new_map.get(key).cloned().unwrap_or(Value::Null);

        if canonicalize(&old_val)? != canonicalize(&new_val)? {
            out.insert(
                key.clone(),
                FieldDelta {
                    from: old_val,
                    to: new_val,
                },
            );
        }
    }
    Ok(out)
}

fn as_object(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// A ledger event payload as seen by [`apply`]: either a full snapshot
/// (CREATE, or a legacy non-delta UPDATE) or `{_isDelta: true, diff: {...}}`.
fn is_delta_payload(payload: &Value) -> bool {
    payload
        .get("_isDelta")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Apply one event payload onto `state` in place.
///
/// If `payload._isDelta == true`, each `diff[k].to` is written into
/// `state[k]`. Otherwise `payload` is shallow-merged into `state` (its keys
/// overwrite `state`'s, keys `state` alone has are preserved).
pub fn apply(state: &mut Value, payload: &Value) -> Result<()> {
    if !state.is_object() {
        *state = Value::Object(Map::new());
    }
    let state_map = state.as_object_mut().expect("just ensured object");

    if is_delta_payload(payload) {
        let diff = payload.get("diff").and_then(Value::as_object).ok_or(DeltaError::MissingDiff)?;
        for (key, record) in diff {
            let to = record.get("to").cloned().unwrap_or(Value::Null);
            state_map.insert(key.clone(), to);
        }
    } else if let Some(obj) = payload.as_object() {
        for (key, value) in obj {
            state_map.insert(key.clone(), value.clone());
        }
    }
    Ok(())
}

/// One entry in a replay history: the entity `version` it was applied at,
/// and the raw ledger event payload.
#[derive(Debug, Clone)]
pub struct VersionedPayload {
    /// The entity version this payload mutated to.
    pub version: u64,
    /// The raw CREATE/UPDATE/DELETE ledger event payload.
    pub payload: Value,
}

/// Fold an ordered history of payloads onto `initial`, sorting by `version`
/// ascending first. This is the sole authoritative replay function: forensic
/// tooling and the live write path must agree on its output for the same
/// history, or invariant 3/testable-property 4 is violated.
pub fn reconstruct(initial: Value, mut events: Vec<VersionedPayload>) -> Result<Value> {
    events.sort_by_key(|e| e.version);
    let mut state = initial;
    for event in &events {
        apply(&mut state, &event.payload)?;
    }
    Ok(state)
}

/// `SHA-256(canonical(payload) || previous_event_id_or("ROOT"))`, hex-encoded.
/// A cheap tamper-evidence check independent of the ledger's own hash chain
/// — used by forensic tooling to spot-check a single event's payload
/// without replaying the whole chain.
pub fn checksum(payload: &Value, previous_event_id: Option<&str>) -> Result<String> {
    let mut bytes = canonicalize(payload)?;
    bytes.extend_from_slice(previous_event_id.unwrap_or("ROOT").as_bytes());
    Ok(ledgercore_hash::h_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;
    use serde_json::json;

    #[test]
    fn delta_detects_changed_field() {
        let old = json!({"amount": 100, "category": "food"});
        let new = json!({"amount": 150, "category": "food"});
        let d = delta(&old, &new).unwrap();
        assert_eq!(d.len(), 1);
        assert_eq!(d["amount"].from, json!(100));
        assert_eq!(d["amount"].to, json!(150));
    }

    #[test]
    fn delta_ignores_numerically_equal_values() {
        let old = json!({"amount": 100});
        let new = json!({"amount": 100.0});
        assert!(delta(&old, &new).unwrap().is_empty());
    }

    #[test]
    fn delta_excludes_dunder_and_timestamp_fields() {
        let old = json!({"__internal": 1, "createdAt": "t0", "updatedAt": "t0", "amount": 1});
        let new = json!({"__internal": 2, "createdAt": "t1", "updatedAt": "t1", "amount": 2});
        let d = delta(&old, &new).unwrap();
        assert_eq!(d.len(), 1);
        assert!(d.contains_key("amount"));
    }

    #[test]
    fn delta_detects_added_and_removed_keys() {
        let old = json!({"a": 1});
        let new = json!({"b": 2});
        let d = delta(&old, &new).unwrap();
        assert_eq!(d.len(), 2);
        assert_eq!(d["a"].to, Value::Null);
        assert_eq!(d["b"].from, Value::Null);
    }

    #[test]
    fn apply_delta_payload_updates_fields() {
        let mut state = json!({"amount": 100, "category": "food"});
        let payload = json!({"_isDelta": true, "diff": {"amount": {"from": 100, "to": 150}}});
        apply(&mut state, &payload).unwrap();
        assert_eq!(state["amount"], json!(150));
        assert_eq!(state["category"], json!("food"));
    }

    #[test]
    fn apply_full_payload_merges_shallow() {
        let mut state = json!({"amount": 100, "category": "food"});
        let payload = json!({"amount": 200});
        apply(&mut state, &payload).unwrap();
        assert_eq!(state["amount"], json!(200));
        assert_eq!(state["category"], json!("food"));
    }

    #[test]
    fn delta_round_trip_via_apply() {
        let old = json!({"amount": 100, "category": "food", "note": "lunch"});
        let new = json!({"amount": 150, "category": "groceries", "note": "lunch"});
        let d = delta(&old, &new).unwrap();
        let diff_value = serde_json::to_value(&d).unwrap();
        let payload = json!({"_isDelta": true, "diff": diff_value});

        let mut state = old.clone();
        apply(&mut state, &payload).unwrap();
        assert_eq!(state, new);
    }

    #[test]
    fn reconstruct_folds_in_version_order_not_insertion_order() {
        let initial = json!({"amount": 0});
        let events = vec![
            VersionedPayload { version: 2, payload: json!({"amount": 2}) },
            VersionedPayload { version: 1, payload: json!({"amount": 1}) },
        ];
        let state = reconstruct(initial, events).unwrap();
        assert_eq!(state["amount"], json!(2));
    }

    #[test]
    fn checksum_is_deterministic_and_chains_previous_id() {
        let payload = json!({"amount": 100});
        let a = checksum(&payload, None).unwrap();
        let b = checksum(&payload, None).unwrap();
        assert_eq!(a, b);
        let c = checksum(&payload, Some("evt-1")).unwrap();
        assert_ne!(a, c);
    }

    #[derive(Clone, Debug)]
    struct SmallObject(Value);

    impl Arbitrary for SmallObject {
        fn arbitrary(g: &mut Gen) -> Self {
            let keys = ["amount", "category", "note", "flag"];
            let mut map = Map::new();
            for k in keys {
                if bool::arbitrary(g) {
                    let choice = u8::arbitrary(g) % 3;
                    let v = match choice {
                        0 => json!(i32::arbitrary(g)),
                        1 => json!(String::arbitrary(g)),
                        _ => json!(bool::arbitrary(g)),
                    };
                    map.insert(k.to_string(), v);
                }
            }
            SmallObject(Value::Object(map))
        }
    }

    #[quickcheck]
    fn delta_round_trip_prop(old: SmallObject, new: SmallObject) -> bool {
        let d = delta(&old.0, &new.0).unwrap();
        let diff_value = serde_json::to_value(&d).unwrap();
        let payload = json!({"_isDelta": true, "diff": diff_value});
        let mut state = old.0.clone();
        apply(&mut state, &payload).unwrap();
        // every key new.0 sets must match; keys old had but new doesn't are nulled
        let new_map = as_object(&new.0);
        let old_map = as_object(&old.0);
        let state_map = as_object(&state);
        new_map.iter().all(|(k, v)| state_map.get(k) == Some(v))
            && old_map
                .keys()
                .filter(|k| !new_map.contains_key(*k) && !is_excluded_key(k))
                .all(|k| state_map.get(k) == Some(&Value::Null) || state_map.get(k).is_none())
    }
}
