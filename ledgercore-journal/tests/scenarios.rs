//! End-to-end scenarios over the journal + interceptor + ledger + entity
//! store stack, run entirely in memory.

use ledgercore_clock::VectorClock;
use ledgercore_entity::{memory::InMemoryEntityStore, EntityDescriptor, EntityError, EntityRegistry, EntityStore};
use ledgercore_journal::{memory::InMemoryJournal, Journal, JournalOperation, JournalStatus};
use ledgercore_interceptor::Interceptor;
use ledgercore_ledger::{memory::InMemoryLedger, EventMetadata, Ledger, TenantId};
use ledgercore_vault::Vault;
use serde_json::{json, Value};
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

struct Harness {
    interceptor: Interceptor,
    ledger: Arc<dyn Ledger>,
    entities: Arc<dyn EntityStore>,
}

fn make_harness() -> Harness {
    let mut registry = EntityRegistry::new();
    registry.register(Box::new(TxDescriptor));
    let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
    let entities: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
    let interceptor = Interceptor::new(
        entities.clone(),
        ledger.clone(),
        Arc::new(Vault::new(b"test-secret".to_vec())),
        Arc::new(registry),
    );
    Harness { interceptor, ledger, entities }
}

fn clock(pairs: &[(&str, u64)]) -> VectorClock {
    pairs.iter().map(|(a, n)| (a.to_string(), *n)).collect()
}

#[tokio::test]
async fn s1_single_create() {
    let journal = InMemoryJournal::new();
    let harness = make_harness();
    let interceptor = &harness.interceptor;

    journal
        .enqueue(
            TenantId("t1".into()),
            "alice:dev1".into(),
            "transaction".into(),
            "tx1".into(),
            JournalOperation::Create,
            json!({"amount": 100, "category": "food"}),
            clock(&[("alice:dev1", 1)]),
            EventMetadata::default(),
        )
        .await
        .unwrap();

    let drained = journal.drain(interceptor, 10).await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].status, JournalStatus::Applied);

    let event = interceptor
        .ledger_for_test()
        .find_last(&TenantId("t1".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.sequence, 1);
    assert_eq!(event.previous_hash, ledgercore_hash::GENESIS_SENTINEL);
    let expected = ledgercore_hash::h_event(&event.payload, &event.previous_hash, 1).unwrap();
    assert_eq!(event.current_hash, expected);
}

#[tokio::test]
async fn s2_update_produces_delta() {
    let journal = InMemoryJournal::new();
    let harness = make_harness();
    let interceptor = &harness.interceptor;

    journal
        .enqueue(
            TenantId("t1".into()),
            "alice:dev1".into(),
            "transaction".into(),
            "tx1".into(),
            JournalOperation::Create,
            json!({"amount": 100, "category": "food"}),
            clock(&[("alice:dev1", 1)]),
            EventMetadata::default(),
        )
        .await
        .unwrap();
    journal.drain(interceptor, 10).await.unwrap();

    journal
        .enqueue(
            TenantId("t1".into()),
            "alice:dev1".into(),
            "transaction".into(),
            "tx1".into(),
            JournalOperation::Update,
            json!({"amount": 150}),
            clock(&[("alice:dev1", 2)]),
            EventMetadata::default(),
        )
        .await
        .unwrap();
    let drained = journal.drain(interceptor, 10).await.unwrap();
    assert_eq!(drained[0].status, JournalStatus::Applied);

    let ledger = harness.ledger;
    let first = ledger.find_last(&TenantId("t1".into())).await.unwrap().unwrap();
    assert_eq!(first.sequence, 2);
    assert_eq!(first.payload["_isDelta"], json!(true));
    assert_eq!(first.payload["diff"]["amount"]["from"], json!(100));
    assert_eq!(first.payload["diff"]["amount"]["to"], json!(150));

    let history = ledger.history_for(&TenantId("t1".into()), "tx1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(first.previous_hash, history[0].current_hash);
}

#[tokio::test]
async fn s3_concurrent_updates_produce_one_conflict() {
    let journal = InMemoryJournal::new();
    let harness = make_harness();
    let interceptor = &harness.interceptor;

    journal
        .enqueue(
            TenantId("t1".into()),
            "alice:dev1".into(),
            "transaction".into(),
            "tx1".into(),
            JournalOperation::Create,
            json!({"amount": 100}),
            clock(&[("A", 1)]),
            EventMetadata::default(),
        )
        .await
        .unwrap();
    journal.drain(interceptor, 10).await.unwrap();

    journal
        .enqueue(
            TenantId("t1".into()),
            "alice:dev1".into(),
            "transaction".into(),
            "tx1".into(),
            JournalOperation::Update,
            json!({"amount": 200}),
            clock(&[("A", 2)]),
            EventMetadata::default(),
        )
        .await
        .unwrap();
    journal
        .enqueue(
            TenantId("t1".into()),
            "bob:dev2".into(),
            "transaction".into(),
            "tx1".into(),
            JournalOperation::Update,
            json!({"amount": 300}),
            clock(&[("A", 1), ("B", 1)]),
            EventMetadata::default(),
        )
        .await
        .unwrap();

    let drained = journal.drain(interceptor, 10).await.unwrap();
    assert_eq!(drained.len(), 2);

    let applied = drained.iter().filter(|e| e.status == JournalStatus::Applied).count();
    let conflicted = drained.iter().filter(|e| e.status == JournalStatus::Conflict).count();
    assert_eq!(applied, 1);
    assert_eq!(conflicted, 1);

    let entity = harness
        .entities
        .get(&ledgercore_entity::EntityKey { tenant: "t1".into(), entity_type: "transaction".into(), entity_id: "tx1".into() })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.version, 3);
    assert_eq!(entity.conflicts.len(), 1);

    let events = harness.ledger.history_for(&TenantId("t1".into()), "tx1").await.unwrap();
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn s4_stale_write_rejected() {
    let journal = InMemoryJournal::new();
    let harness = make_harness();
    let interceptor = &harness.interceptor;

    journal
        .enqueue(
            TenantId("t1".into()),
            "alice:dev1".into(),
            "transaction".into(),
            "tx1".into(),
            JournalOperation::Create,
            json!({"amount": 100}),
            clock(&[("A", 3)]),
            EventMetadata::default(),
        )
        .await
        .unwrap();
    journal.drain(interceptor, 10).await.unwrap();

    journal
        .enqueue(
            TenantId("t1".into()),
            "alice:dev1".into(),
            "transaction".into(),
            "tx1".into(),
            JournalOperation::Update,
            json!({"amount": 999}),
            clock(&[("A", 1)]),
            EventMetadata::default(),
        )
        .await
        .unwrap();
    let drained = journal.drain(interceptor, 10).await.unwrap();
    assert_eq!(drained[0].status, JournalStatus::Stale);

    let events = harness.ledger.history_for(&TenantId("t1".into()), "tx1").await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn property_7_no_entry_remains_pending_under_functional_drainer() {
    let journal = InMemoryJournal::new();
    let harness = make_harness();
    let interceptor = &harness.interceptor;
    for i in 0..20 {
        journal
            .enqueue(
                TenantId("t1".into()),
                "alice:dev1".into(),
                "transaction".into(),
                format!("tx{i}"),
                JournalOperation::Create,
                json!({"amount": i}),
                clock(&[("alice:dev1", i as u64 + 1)]),
                EventMetadata::default(),
            )
            .await
            .unwrap();
    }
    let drained = journal.drain(interceptor, 20).await.unwrap();
    assert_eq!(drained.len(), 20);
    assert!(drained.iter().all(|e| e.status.is_terminal()));
}
