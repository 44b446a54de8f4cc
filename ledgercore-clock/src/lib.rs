//! Vector clocks and the conflict resolver that sits on top of them.
//!
//! A vector clock is a map from actor identifier (`"{principalId}:{deviceId}"`,
//! per spec) to a monotone counter. [`reconcile`] is the function the
//! journal drainer calls on every UPDATE/DELETE apply to decide whether the
//! writer had seen current state (`Apply`), was behind (`Stale`), or raced
//! another writer (`Conflict`).

#![deny(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `"{principalId}:{deviceId}"`.
pub type ActorId = String;

/// A vector clock: per-actor monotone counters.
pub type VectorClock = BTreeMap<ActorId, u64>;

/// `true` iff `a` happened strictly before `b`: every counter in `a` is
/// `<=` the matching counter in `b`, and at least one is strictly `<`.
pub fn happens_before(a: &VectorClock, b: &VectorClock) -> bool {
    let mut strictly_less = false;
    let all_actors = a.keys().chain(b.keys());
    for actor in all_actors {
        let av = a.get(actor).copied().unwrap_or(0);
        let bv = b.get(actor).copied().unwrap_or(0);
        if av > bv {
            return false;
        }
        if av < bv {
            strictly_less = true;
        }
    }
    strictly_less
}

/// `true` iff neither clock happened before the other.
pub fn concurrent(a: &VectorClock, b: &VectorClock) -> bool {
    !happens_before(a, b) && !happens_before(b, a)
}

/// Per-key maximum of two clocks.
pub fn merge(a: &VectorClock, b: &VectorClock) -> VectorClock {
    let mut out = a.clone();
    for (actor, &count) in b {
        let entry = out.entry(actor.clone()).or_insert(0);
        if count > *entry {
            *entry = count;
        }
    }
    out
}

/// `clock` with `actor`'s counter incremented by one (actor absent ⇒ starts at 1).
pub fn tick(clock: &VectorClock, actor: &str) -> VectorClock {
    let mut out = clock.clone();
    let entry = out.entry(actor.to_string()).or_insert(0);
    *entry += 1;
    out
}

/// The outcome of reconciling a journal entry's vector clock against the
/// target entity's current vector clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The writer had seen the entity's current state; apply the mutation.
    Apply,
    /// The writer was behind the entity's current state; discard silently.
    Stale,
    /// The writer raced another concurrent writer; resolve via policy.
    Conflict,
}

/// Decide APPLY / STALE / CONFLICT for a journal entry against an entity's
/// current vector clock.
pub fn reconcile(entity_clock: &VectorClock, journal_clock: &VectorClock) -> ReconcileOutcome {
    if happens_before(entity_clock, journal_clock) {
        ReconcileOutcome::Apply
    } else if happens_before(journal_clock, entity_clock) {
        ReconcileOutcome::Stale
    } else {
        ReconcileOutcome::Conflict
    }
}

/// Result of resolving a CONFLICT: the payload that wins and is applied to
/// the entity, and the payload that loses and is retained in
/// `entity.conflicts[]` for operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    /// The payload applied to the entity.
    pub winner: Value,
    /// The payload recorded under `conflicts[]` but not applied.
    pub loser: Value,
    /// If `true`, `winner` is a partial write and must be folded onto the
    /// entity's current value (via `ledgercore_delta::apply`) rather than
    /// replacing it outright. [`LastWriterWins`] sets this when the
    /// incoming side wins, since `incoming` is the raw write payload, not a
    /// full document. [`FieldWiseMerge`] never sets it: its `winner` is
    /// already the complete merged document.
    pub merge_into_current: bool,
}

/// A pluggable conflict resolution policy, selectable per entity type.
/// The default system-wide policy is [`LastWriterWins`]; a future per-type
/// override may install [`FieldWiseMerge`] instead.
pub trait ConflictPolicy {
    /// Resolve a concurrent write. `current`/`current_ts` describe the
    /// entity's state as currently persisted (itself possibly the result of
    /// an earlier apply); `incoming`/`incoming_ts` describe the journaled
    /// write being reconciled.
    fn resolve(
        &self,
        current: &Value,
        current_ts: i64,
        incoming: &Value,
        incoming_ts: i64,
    ) -> ConflictResolution;
}

/// Later wall-clock timestamp wins; ties break toward `incoming` so the
/// journal drainer always makes forward progress on a tie rather than
/// looping.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriterWins;

impl ConflictPolicy for LastWriterWins {
    fn resolve(
        &self,
        current: &Value,
        current_ts: i64,
        incoming: &Value,
        incoming_ts: i64,
    ) -> ConflictResolution {
        if incoming_ts >= current_ts {
            ConflictResolution {
                winner: incoming.clone(),
                loser: current.clone(),
                merge_into_current: true,
            }
        } else {
            ConflictResolution {
                winner: current.clone(),
                loser: incoming.clone(),
                merge_into_current: false,
            }
        }
    }
}

/// Field-wise union: for each field present in either payload, prefer
/// whichever side is non-null, breaking ties toward the newer timestamp.
/// The "loser" side records the fields that were overridden, not a full
/// payload, since `FieldWiseMerge` has no single losing document.
#[derive(Debug, Default, Clone, Copy)]
pub struct FieldWiseMerge;

impl ConflictPolicy for FieldWiseMerge {
    fn resolve(
        &self,
        current: &Value,
        current_ts: i64,
        incoming: &Value,
        incoming_ts: i64,
    ) -> ConflictResolution {
        let current_obj = current.as_object().cloned().unwrap_or_default();
        let incoming_obj = incoming.as_object().cloned().unwrap_or_default();

        let mut merged = serde_json::Map::new();
        let mut overridden = serde_json::Map::new();

        let mut keys: Vec<&String> = current_obj.keys().chain(incoming_obj.keys()).collect();
        keys.sort();
        keys.dedup();

        let incoming_is_newer = incoming_ts >= current_ts;

        for key in keys {
            let cur_val = current_obj.get(key).cloned().unwrap_or(Value::Null);
            let inc_val = incoming_obj.get(key).cloned().unwrap_or(Value::Null);

            let chosen = match (cur_val.is_null(), inc_val.is_null()) {
                (false, true) => cur_val.clone(),
                (true, false) => inc_val.clone(),
                (true, true) => Value::Null,
                (false, false) => {
                    if incoming_is_newer {
                        inc_val.clone()
                    } else {
                        cur_val.clone()
                    }
                }
            };
            let other = if chosen == cur_val { inc_val } else { cur_val };
            if other != chosen {
                overridden.insert(key.clone(), other);
            }
            merged.insert(key.clone(), chosen);
        }

        ConflictResolution {
            winner: Value::Object(merged),
            loser: Value::Object(overridden),
            merge_into_current: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use serde_json::json;

    fn vc(pairs: &[(&str, u64)]) -> VectorClock {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn happens_before_basic() {
        let a = vc(&[("A", 1)]);
        let b = vc(&[("A", 2)]);
        assert!(happens_before(&a, &b));
        assert!(!happens_before(&b, &a));
    }

    #[test]
    fn concurrent_when_neither_dominates() {
        let a = vc(&[("A", 2)]);
        let b = vc(&[("A", 1), ("B", 1)]);
        assert!(concurrent(&a, &b));
    }

    #[test]
    fn equal_clocks_are_not_happens_before_or_concurrent() {
        let a = vc(&[("A", 1)]);
        let b = vc(&[("A", 1)]);
        assert!(!happens_before(&a, &b));
        assert!(!happens_before(&b, &a));
        assert!(!concurrent(&a, &b));
    }

    #[test]
    fn merge_takes_per_key_max() {
        let a = vc(&[("A", 2), ("B", 1)]);
        let b = vc(&[("A", 1), ("B", 3), ("C", 1)]);
        let m = merge(&a, &b);
        assert_eq!(m, vc(&[("A", 2), ("B", 3), ("C", 1)]));
    }

    #[test]
    fn tick_increments_own_actor_and_starts_at_one() {
        let empty = vc(&[]);
        let t1 = tick(&empty, "A");
        assert_eq!(t1.get("A"), Some(&1));
        let t2 = tick(&t1, "A");
        assert_eq!(t2.get("A"), Some(&2));
    }

    #[test]
    fn reconcile_matches_s3_scenario() {
        // entity at {A:1}; X bumps to {A:2}; Y proposes {A:1,B:1} concurrently.
        let entity = vc(&[("A", 1)]);
        let x = vc(&[("A", 2)]);
        let y = vc(&[("A", 1), ("B", 1)]);

        assert_eq!(reconcile(&entity, &x), ReconcileOutcome::Apply);
        assert_eq!(reconcile(&entity, &y), ReconcileOutcome::Conflict);
    }

    #[test]
    fn reconcile_stale_when_journal_behind() {
        let entity = vc(&[("A", 3)]);
        let journal = vc(&[("A", 1)]);
        assert_eq!(reconcile(&entity, &journal), ReconcileOutcome::Stale);
    }

    #[test]
    fn lww_picks_later_timestamp() {
        let policy = LastWriterWins;
        let r = policy.resolve(&json!({"amount": 1}), 100, &json!({"amount": 2}), 200);
        assert_eq!(r.winner, json!({"amount": 2}));
        assert_eq!(r.loser, json!({"amount": 1}));
        assert!(r.merge_into_current);
    }

    #[test]
    fn lww_tie_breaks_toward_incoming() {
        let policy = LastWriterWins;
        let r = policy.resolve(&json!({"a": 1}), 100, &json!({"a": 2}), 100);
        assert_eq!(r.winner, json!({"a": 2}));
        assert!(r.merge_into_current);
    }

    #[test]
    fn lww_current_wins_is_not_merged() {
        let policy = LastWriterWins;
        let r = policy.resolve(&json!({"a": 1}), 200, &json!({"a": 2}), 100);
        assert_eq!(r.winner, json!({"a": 1}));
        assert!(!r.merge_into_current);
    }

    #[test]
    fn field_wise_merge_prefers_non_null() {
        let policy = FieldWiseMerge;
        let current = json!({"amount": 100, "note": Value::Null});
        let incoming = json!({"amount": Value::Null, "note": "lunch"});
        let r = policy.resolve(&current, 100, &incoming, 200);
        assert_eq!(r.winner["amount"], json!(100));
        assert_eq!(r.winner["note"], json!("lunch"));
    }

    #[quickcheck]
    fn happens_before_is_antisymmetric(a: Vec<(String, u64)>, b: Vec<(String, u64)>) -> bool {
        let a: VectorClock = a.into_iter().collect();
        let b: VectorClock = b.into_iter().collect();
        !(happens_before(&a, &b) && happens_before(&b, &a))
    }

    #[quickcheck]
    fn merge_is_commutative(a: Vec<(String, u64)>, b: Vec<(String, u64)>) -> bool {
        let a: VectorClock = a.into_iter().collect();
        let b: VectorClock = b.into_iter().collect();
        merge(&a, &b) == merge(&b, &a)
    }
}
