//! In-process ledger backed by a single mutex-guarded map. Intended for
//! tests and local experimentation, not production — there is no
//! durability and no cross-process coordination.

use crate::{
    verify_events, ChainVerification, EntityRef, EventMetadata, Ledger, LedgerError, LedgerEvent,
    LedgerEventType, Result, TenantId,
};
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    events: HashMap<TenantId, Vec<LedgerEvent>>,
    quarantined: HashSet<TenantId>,
}

/// An in-memory [`Ledger`]. Appends for every tenant share one coarse lock,
/// which is fine for tests but would serialize unrelated tenants in
/// production — that tradeoff is why [`crate::postgres::PgLedger`] exists.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl InMemoryLedger {
    /// A fresh, empty ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Ledger for InMemoryLedger {
    async fn append(
        &self,
        tenant: &TenantId,
        entity: EntityRef,
        event_type: LedgerEventType,
        payload: serde_json::Value,
        author: &str,
        metadata: EventMetadata,
    ) -> Result<LedgerEvent> {
        let mut state = self.state.lock().await;
        if state.quarantined.contains(tenant) {
            return Err(LedgerError::Quarantined(tenant.clone()));
        }

        let chain = state.events.entry(tenant.clone()).or_default();
        let last = chain.last();
        let sequence = last.map(|e| e.sequence + 1).unwrap_or(1);
        let previous_event_id = last.map(|e| e.id);
        let previous_hash = last
            .map(|e| e.current_hash.clone())
            .unwrap_or_else(|| ledgercore_hash::GENESIS_SENTINEL.to_string());

        let current_hash = ledgercore_hash::h_event(&payload, &previous_hash, sequence)?;

        let event = LedgerEvent {
            id: Uuid::new_v4(),
            tenant: tenant.clone(),
            sequence,
            event_type,
            entity,
            payload,
            author: author.to_string(),
            previous_event_id,
            previous_hash,
            current_hash,
            metadata,
            created_at: OffsetDateTime::now_utc(),
        };

        chain.push(event.clone());
        Ok(event)
    }

    async fn find_last(&self, tenant: &TenantId) -> Result<Option<LedgerEvent>> {
        let state = self.state.lock().await;
        Ok(state.events.get(tenant).and_then(|c| c.last()).cloned())
    }

    async fn range(&self, tenant: &TenantId, start_seq: u64, end_seq: u64) -> Result<Vec<LedgerEvent>> {
        if start_seq > end_seq {
            return Err(LedgerError::InvalidRange { start: start_seq, end: end_seq });
        }
        let state = self.state.lock().await;
        let out = state
            .events
            .get(tenant)
            .map(|chain| {
                chain
                    .iter()
                    .filter(|e| e.sequence >= start_seq && e.sequence <= end_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(out)
    }

    async fn history_for(&self, tenant: &TenantId, entity_id: &str) -> Result<Vec<LedgerEvent>> {
        let state = self.state.lock().await;
        let out = state
            .events
            .get(tenant)
            .map(|chain| {
                chain
                    .iter()
                    .filter(|e| e.entity.entity_id == entity_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(out)
    }

    async fn find_by_id(&self, tenant: &TenantId, event_id: Uuid) -> Result<Option<LedgerEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .get(tenant)
            .and_then(|chain| chain.iter().find(|e| e.id == event_id))
            .cloned())
    }

    async fn verify_chain(
        &self,
        tenant: &TenantId,
        start_seq: Option<u64>,
        end_seq: Option<u64>,
    ) -> Result<ChainVerification> {
        let state = self.state.lock().await;
        let chain = match state.events.get(tenant) {
            Some(c) => c,
            None => {
                return Ok(ChainVerification {
                    valid: true,
                    first_corruption: None,
                })
            }
        };
        let start = start_seq.unwrap_or(1);
        let end = end_seq.unwrap_or_else(|| chain.last().map(|e| e.sequence).unwrap_or(0));
        let slice: Vec<LedgerEvent> = chain
            .iter()
            .filter(|e| e.sequence >= start && e.sequence <= end)
            .cloned()
            .collect();
        verify_events(&slice)
    }

    async fn is_quarantined(&self, tenant: &TenantId) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.quarantined.contains(tenant))
    }

    async fn quarantine(&self, tenant: &TenantId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.quarantined.insert(tenant.clone());
        Ok(())
    }

    async fn repair(&self, tenant: &TenantId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.quarantined.remove(tenant);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: &str) -> EntityRef {
        EntityRef {
            entity_type: "transaction".to_string(),
            entity_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn sequence_is_gap_free_and_starts_at_one() {
        let ledger = InMemoryLedger::new();
        let tenant = TenantId::from("t1");
        for i in 0..5 {
            let e = ledger
                .append(
                    &tenant,
                    entity("e1"),
                    LedgerEventType::Updated,
                    json!({"n": i}),
                    "alice",
                    EventMetadata::default(),
                )
                .await
                .unwrap();
            assert_eq!(e.sequence, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn each_event_chains_to_previous_hash() {
        let ledger = InMemoryLedger::new();
        let tenant = TenantId::from("t1");
        let first = ledger
            .append(&tenant, entity("e1"), LedgerEventType::Created, json!({"n": 1}), "alice", EventMetadata::default())
            .await
            .unwrap();
        assert_eq!(first.previous_hash, ledgercore_hash::GENESIS_SENTINEL);

        let second = ledger
            .append(&tenant, entity("e1"), LedgerEventType::Updated, json!({"n": 2}), "alice", EventMetadata::default())
            .await
            .unwrap();
        assert_eq!(second.previous_hash, first.current_hash);
        assert_eq!(second.previous_event_id, Some(first.id));
    }

    #[tokio::test]
    async fn verify_chain_detects_tampering() {
        let ledger = InMemoryLedger::new();
        let tenant = TenantId::from("t1");
        for i in 0..3 {
            ledger
                .append(&tenant, entity("e1"), LedgerEventType::Updated, json!({"n": i}), "alice", EventMetadata::default())
                .await
                .unwrap();
        }

        let ok = ledger.verify_chain(&tenant, None, None).await.unwrap();
        assert!(ok.valid);

        {
            let mut state = ledger.state.lock().await;
            let chain = state.events.get_mut(&tenant).unwrap();
            chain[1].payload = json!({"n": "tampered"});
        }

        let broken = ledger.verify_chain(&tenant, None, None).await.unwrap();
        assert!(!broken.valid);
        assert_eq!(broken.first_corruption, Some(2));
    }

    #[tokio::test]
    async fn quarantine_blocks_append_until_repaired() {
        let ledger = InMemoryLedger::new();
        let tenant = TenantId::from("t1");
        ledger.quarantine(&tenant).await.unwrap();

        let err = ledger
            .append(&tenant, entity("e1"), LedgerEventType::Created, json!({}), "alice", EventMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Quarantined(_)));

        ledger.repair(&tenant).await.unwrap();
        assert!(ledger
            .append(&tenant, entity("e1"), LedgerEventType::Created, json!({}), "alice", EventMetadata::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn history_for_filters_by_entity() {
        let ledger = InMemoryLedger::new();
        let tenant = TenantId::from("t1");
        ledger.append(&tenant, entity("a"), LedgerEventType::Created, json!({}), "alice", EventMetadata::default()).await.unwrap();
        ledger.append(&tenant, entity("b"), LedgerEventType::Created, json!({}), "alice", EventMetadata::default()).await.unwrap();
        ledger.append(&tenant, entity("a"), LedgerEventType::Updated, json!({}), "alice", EventMetadata::default()).await.unwrap();

        let history = ledger.history_for(&tenant, "a").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.entity.entity_id == "a"));
    }
}
