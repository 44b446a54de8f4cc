//! In-process journal for tests: entries held in creation order in a single
//! mutex-guarded `Vec`.

use crate::{apply_entry, Journal, JournalEntry, JournalOperation, JournalStatus, Result, DEFAULT_MAX_RETRIES};
use ledgercore_clock::VectorClock;
use ledgercore_interceptor::Interceptor;
use ledgercore_ledger::{EventMetadata, TenantId};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

/// An in-memory [`Journal`].
pub struct InMemoryJournal {
    entries: Mutex<Vec<JournalEntry>>,
    max_retries: u32,
}

impl InMemoryJournal {
    /// A fresh, empty journal with the default retry limit.
    pub fn new() -> Self {
        Self { entries: Mutex::new(Vec::new()), max_retries: DEFAULT_MAX_RETRIES }
    }

    /// A journal with a custom retry limit, for tests exercising the
    /// exhausted-retries path without five iterations.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self { entries: Mutex::new(Vec::new()), max_retries }
    }
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Journal for InMemoryJournal {
    async fn enqueue(
        &self,
        tenant: TenantId,
        author: String,
        entity_type: String,
        entity_id: String,
        operation: JournalOperation,
        payload: Value,
        vector_clock: VectorClock,
        metadata: EventMetadata,
    ) -> Result<JournalEntry> {
        let now = OffsetDateTime::now_utc();
        let entry = JournalEntry {
            id: Uuid::new_v4(),
            tenant,
            author,
            entity_type,
            entity_id,
            operation,
            payload,
            vector_clock,
            status: JournalStatus::Pending,
            retry_count: 0,
            error_reason: None,
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.entries.lock().await.push(entry.clone());
        Ok(entry)
    }

    async fn drain(&self, interceptor: &Interceptor, batch_size: usize) -> Result<Vec<JournalEntry>> {
        let pending_indices: Vec<usize> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.status == JournalStatus::Pending)
                .take(batch_size)
                .map(|(i, _)| i)
                .collect()
        };

        let mut touched = Vec::with_capacity(pending_indices.len());
        for idx in pending_indices {
            let mut entry = {
                let entries = self.entries.lock().await;
                entries[idx].clone()
            };
            apply_entry(interceptor, &mut entry, self.max_retries).await;
            {
                let mut entries = self.entries.lock().await;
                entries[idx] = entry.clone();
            }
            touched.push(entry);
        }
        Ok(touched)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JournalEntry>> {
        Ok(self.entries.lock().await.iter().find(|e| e.id == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgercore_entity::{memory::InMemoryEntityStore, EntityDescriptor, EntityError, EntityRegistry};
    use ledgercore_ledger::memory::InMemoryLedger;
    use ledgercore_vault::Vault;
    use serde_json::json;
    use std::sync::Arc;

    struct TxDescriptor;
    impl EntityDescriptor for TxDescriptor {
        fn entity_type(&self) -> &'static str {
            "transaction"
        }
        fn validate(&self, value: &Value) -> ledgercore_entity::Result<()> {
            if value.get("amount").and_then(Value::as_f64).is_none() {
                return Err(EntityError::Validation {
                    entity_type: "transaction".to_string(),
                    field: "amount".to_string(),
                    reason: "missing".to_string(),
                });
            }
            Ok(())
        }
    }

    fn make_interceptor() -> Interceptor {
        let mut registry = EntityRegistry::new();
        registry.register(Box::new(TxDescriptor));
        Interceptor::new(
            Arc::new(InMemoryEntityStore::new()),
            Arc::new(InMemoryLedger::new()),
            Arc::new(Vault::new(b"test-secret".to_vec())),
            Arc::new(registry),
        )
    }

    fn clock(actor: &str, n: u64) -> VectorClock {
        [(actor.to_string(), n)].into_iter().collect()
    }

    #[tokio::test]
    async fn enqueue_returns_pending_entry() {
        let journal = InMemoryJournal::new();
        let entry = journal
            .enqueue(
                TenantId("t1".into()),
                "alice:dev1".into(),
                "transaction".into(),
                "tx1".into(),
                JournalOperation::Create,
                json!({"amount": 100}),
                clock("alice:dev1", 1),
                EventMetadata::default(),
            )
            .await
            .unwrap();
        assert_eq!(entry.status, JournalStatus::Pending);
        assert_eq!(entry.retry_count, 0);
    }

    #[tokio::test]
    async fn drain_applies_pending_entries_in_fifo_order() {
        let journal = InMemoryJournal::new();
        let interceptor = make_interceptor();

        journal
            .enqueue(
                TenantId("t1".into()),
                "alice:dev1".into(),
                "transaction".into(),
                "tx1".into(),
                JournalOperation::Create,
                json!({"amount": 100}),
                clock("alice:dev1", 1),
                EventMetadata::default(),
            )
            .await
            .unwrap();
        journal
            .enqueue(
                TenantId("t1".into()),
                "alice:dev1".into(),
                "transaction".into(),
                "tx2".into(),
                JournalOperation::Create,
                json!({"amount": 200}),
                clock("alice:dev1", 2),
                EventMetadata::default(),
            )
            .await
            .unwrap();

        let drained = journal.drain(&interceptor, 10).await.unwrap();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|e| e.status == JournalStatus::Applied));
        assert_eq!(drained[0].entity_id, "tx1");
        assert_eq!(drained[1].entity_id, "tx2");
    }

    #[tokio::test]
    async fn create_on_existing_entity_is_stale() {
        let journal = InMemoryJournal::new();
        let interceptor = make_interceptor();

        journal
            .enqueue(
                TenantId("t1".into()),
                "alice:dev1".into(),
                "transaction".into(),
                "tx1".into(),
                JournalOperation::Create,
                json!({"amount": 100}),
                clock("alice:dev1", 1),
                EventMetadata::default(),
            )
            .await
            .unwrap();
        journal.drain(&interceptor, 10).await.unwrap();

        journal
            .enqueue(
                TenantId("t1".into()),
                "alice:dev1".into(),
                "transaction".into(),
                "tx1".into(),
                JournalOperation::Create,
                json!({"amount": 999}),
                clock("alice:dev1", 1),
                EventMetadata::default(),
            )
            .await
            .unwrap();
        let drained = journal.drain(&interceptor, 10).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].status, JournalStatus::Stale);
    }

    #[tokio::test]
    async fn entry_never_re_enters_pending_once_terminal() {
        let journal = InMemoryJournal::new();
        let interceptor = make_interceptor();
        journal
            .enqueue(
                TenantId("t1".into()),
                "alice:dev1".into(),
                "transaction".into(),
                "tx1".into(),
                JournalOperation::Create,
                json!({"amount": 100}),
                clock("alice:dev1", 1),
                EventMetadata::default(),
            )
            .await
            .unwrap();
        let first_drain = journal.drain(&interceptor, 10).await.unwrap();
        let id = first_drain[0].id;

        let second_drain = journal.drain(&interceptor, 10).await.unwrap();
        assert!(second_drain.is_empty());
        let fetched = journal.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JournalStatus::Applied);
    }
}
