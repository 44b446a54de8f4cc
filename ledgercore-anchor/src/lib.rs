//! The Merkle anchor worker: periodically roots up a tenant's new ledger
//! events into a [`MerkleAnchor`], chaining each anchor to the last so the
//! anchors themselves form a verifiable sequence.
//!
//! Reuses [`ledgercore_hash::build_root`]/[`ledgercore_hash::generate_proof`]
//! over the `current_hash` column of [`ledgercore_ledger::LedgerEvent`]. The
//! worker is periodic, per-tenant, and an idempotent no-op when there is
//! nothing new, so the orchestrator can schedule it by name alongside the
//! other background tasks.

#![deny(unsafe_code)]

pub mod memory;
pub mod postgres;

use ledgercore_hash::ProofStep;
use ledgercore_ledger::{Ledger, LedgerError, TenantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// A periodic Merkle root over a contiguous ledger range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleAnchor {
    pub id: Uuid,
    pub tenant: TenantId,
    pub start_sequence: u64,
    pub end_sequence: u64,
    /// Hex-encoded Merkle root over `[events[start..=end].current_hash]`.
    pub root_hash: String,
    /// The previous anchor's `root_hash`, or [`ledgercore_hash::GENESIS_SENTINEL`].
    pub prev_root_hash: String,
    pub event_count: u64,
    pub tree_depth: u32,
    pub verified: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Errors from anchor operations.
#[derive(Debug, Error)]
pub enum AnchorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Hash(#[from] ledgercore_hash::HashError),

    #[error("sequence {0} is outside anchor {1}..={2}")]
    SequenceOutsideAnchor(u64, u64, u64),

    #[error("malformed stored hash: {0}")]
    MalformedHash(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, AnchorError>;

/// Durable storage for anchors, one tenant's anchors ordered by
/// `start_sequence`.
#[async_trait::async_trait]
pub trait AnchorStore: Send + Sync {
    /// The most recently created anchor for `tenant`, if any.
    async fn last_anchor(&self, tenant: &TenantId) -> Result<Option<MerkleAnchor>>;

    /// Persist a newly computed anchor.
    async fn append(&self, anchor: MerkleAnchor) -> Result<MerkleAnchor>;

    /// All anchors for `tenant`, ordered by `start_sequence` ascending —
    /// used to check the Merkle-chain invariant (spec testable property 6).
    async fn history(&self, tenant: &TenantId) -> Result<Vec<MerkleAnchor>>;
}

fn decode_hash(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str).map_err(|e| AnchorError::MalformedHash(e.to_string()))?;
    bytes.try_into().map_err(|_| AnchorError::MalformedHash(hex_str.to_string()))
}

/// Run one anchor cycle for `tenant`. Idempotent: if there are no events
/// past the last anchor, returns `Ok(None)` without writing anything.
pub async fn run_for_tenant(
    ledger: &dyn Ledger,
    store: &dyn AnchorStore,
    tenant: &TenantId,
) -> Result<Option<MerkleAnchor>> {
    let last_anchor = store.last_anchor(tenant).await?;
    let start_seq = last_anchor.as_ref().map(|a| a.end_sequence + 1).unwrap_or(1);

    let end_seq = match ledger.find_last(tenant).await? {
        Some(last) => last.sequence,
        None => return Ok(None),
    };
    if end_seq < start_seq {
        return Ok(None);
    }

    let events = ledger.range(tenant, start_seq, end_seq).await?;
    let mut hashes = Vec::with_capacity(events.len());
    for event in &events {
        hashes.push(decode_hash(&event.current_hash)?);
    }

    let root = ledgercore_hash::build_root(&hashes);
    let prev_root_hash = last_anchor.as_ref().map(|a| a.root_hash.clone()).unwrap_or_else(|| ledgercore_hash::GENESIS_SENTINEL.to_string());

    let anchor = MerkleAnchor {
        id: Uuid::new_v4(),
        tenant: tenant.clone(),
        start_sequence: start_seq,
        end_sequence: end_seq,
        root_hash: hex::encode(root),
        prev_root_hash,
        event_count: hashes.len() as u64,
        tree_depth: ledgercore_hash::tree_depth(hashes.len()),
        verified: true,
        created_at: OffsetDateTime::now_utc(),
    };
    Ok(Some(store.append(anchor).await?))
}

/// Build an inclusion proof for the event at `sequence` within `anchor`'s
/// range, re-deriving the leaf set from the ledger (anchors do not store
/// leaves themselves, only the root).
pub async fn inclusion_proof(
    ledger: &dyn Ledger,
    tenant: &TenantId,
    anchor: &MerkleAnchor,
    sequence: u64,
) -> Result<(Vec<ProofStep>, [u8; 32])> {
    if sequence < anchor.start_sequence || sequence > anchor.end_sequence {
        return Err(AnchorError::SequenceOutsideAnchor(sequence, anchor.start_sequence, anchor.end_sequence));
    }
    let events = ledger.range(tenant, anchor.start_sequence, anchor.end_sequence).await?;
    let mut hashes = Vec::with_capacity(events.len());
    for event in &events {
        hashes.push(decode_hash(&event.current_hash)?);
    }
    let index = (sequence - anchor.start_sequence) as usize;
    let proof = ledgercore_hash::generate_proof(&hashes, index)?;
    let root = decode_hash(&anchor.root_hash)?;
    Ok((proof, root))
}

/// Check the Merkle-chain invariant (spec testable property 6) over an
/// ordered, contiguous list of one tenant's anchors: each anchor's
/// `start_sequence` immediately follows the prior's `end_sequence`, and its
/// `prev_root_hash` matches the prior's `root_hash`.
pub fn verify_anchor_chain(anchors: &[MerkleAnchor]) -> bool {
    let mut prev: Option<&MerkleAnchor> = None;
    for anchor in anchors {
        match prev {
            None => {
                if anchor.prev_root_hash != ledgercore_hash::GENESIS_SENTINEL {
                    return false;
                }
            }
            Some(p) => {
                if anchor.start_sequence != p.end_sequence + 1 || anchor.prev_root_hash != p.root_hash {
                    return false;
                }
            }
        }
        prev = Some(anchor);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgercore_ledger::{memory::InMemoryLedger, EntityRef, EventMetadata, LedgerEventType};
    use memory::InMemoryAnchorStore;
    use serde_json::json;

    async fn seed_events(ledger: &InMemoryLedger, tenant: &TenantId, n: u64) {
        for i in 0..n {
            ledger
                .append(
                    tenant,
                    EntityRef { entity_type: "transaction".into(), entity_id: format!("tx{i}") },
                    LedgerEventType::Created,
                    json!({"amount": i}),
                    "alice:dev1",
                    EventMetadata::default(),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn s5_merkle_anchor_over_five_events() {
        let ledger = InMemoryLedger::new();
        let store = InMemoryAnchorStore::new();
        let tenant = TenantId("t1".into());
        seed_events(&ledger, &tenant, 5).await;

        let anchor = run_for_tenant(&ledger, &store, &tenant).await.unwrap().unwrap();
        assert_eq!(anchor.start_sequence, 1);
        assert_eq!(anchor.end_sequence, 5);
        assert_eq!(anchor.event_count, 5);
        assert_eq!(anchor.tree_depth, 3);
        assert_eq!(anchor.prev_root_hash, ledgercore_hash::GENESIS_SENTINEL);

        let events = ledger.range(&tenant, 1, 5).await.unwrap();
        let (proof, root) = inclusion_proof(&ledger, &tenant, &anchor, 4).await.unwrap();
        let leaf = decode_hash(&events[3].current_hash).unwrap();
        assert!(ledgercore_hash::verify_proof(leaf, &proof, root));
    }

    #[tokio::test]
    async fn rerunning_with_no_new_events_is_a_no_op() {
        let ledger = InMemoryLedger::new();
        let store = InMemoryAnchorStore::new();
        let tenant = TenantId("t1".into());
        seed_events(&ledger, &tenant, 3).await;

        run_for_tenant(&ledger, &store, &tenant).await.unwrap();
        let second = run_for_tenant(&ledger, &store, &tenant).await.unwrap();
        assert!(second.is_none());
        assert_eq!(store.history(&tenant).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_anchor_chains_to_first() {
        let ledger = InMemoryLedger::new();
        let store = InMemoryAnchorStore::new();
        let tenant = TenantId("t1".into());
        seed_events(&ledger, &tenant, 3).await;
        run_for_tenant(&ledger, &store, &tenant).await.unwrap();

        seed_events(&ledger, &tenant, 2).await;
        let second = run_for_tenant(&ledger, &store, &tenant).await.unwrap().unwrap();
        assert_eq!(second.start_sequence, 4);
        assert_eq!(second.end_sequence, 5);

        let history = store.history(&tenant).await.unwrap();
        assert!(verify_anchor_chain(&history));
    }
}
