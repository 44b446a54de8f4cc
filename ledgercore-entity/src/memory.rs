//! In-process entity store for tests: one mutex-guarded map per store
//! instance, keyed by [`EntityKey`].

use crate::{
    reconcile_delete, reconcile_update, ApplyOutcome, ApplyStatus, Entity, EntityDescriptor,
    EntityError, EntityKey, EntitySnapshot, EntityStore, Result, SnapshotStore,
};
use ledgercore_clock::VectorClock;
use serde_json::Value;
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

/// An in-memory [`EntityStore`].
#[derive(Default)]
pub struct InMemoryEntityStore {
    entities: Mutex<HashMap<EntityKey, Entity>>,
}

impl InMemoryEntityStore {
    /// A fresh, empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get(&self, key: &EntityKey) -> Result<Option<Entity>> {
        Ok(self.entities.lock().await.get(key).cloned())
    }

    async fn find(&self, tenant: &str, entity_type: &str) -> Result<Vec<Entity>> {
        let map = self.entities.lock().await;
        Ok(map
            .values()
            .filter(|e| e.key.tenant == tenant && e.key.entity_type == entity_type && !e.is_deleted())
            .cloned()
            .collect())
    }

    async fn apply_create(
        &self,
        descriptor: &dyn EntityDescriptor,
        key: EntityKey,
        payload: Value,
        vector_clock: VectorClock,
        proposed_at: OffsetDateTime,
    ) -> Result<ApplyOutcome> {
        descriptor.validate(&payload)?;
        let mut map = self.entities.lock().await;

        if let Some(existing) = map.get(&key) {
            return Ok(ApplyOutcome {
                before: Some(existing.clone()),
                after: Some(existing.clone()),
                status: ApplyStatus::Stale,
            });
        }

        let entity = Entity {
            id: Uuid::new_v4(),
            key: key.clone(),
            value: payload,
            version: 1,
            vector_clock,
            conflicts: vec![],
            ledger_sequence: None,
            last_ledger_event_id: None,
            deleted_at: None,
            processing_log: Vec::new(),
            last_write_at: proposed_at,
        };
        map.insert(key, entity.clone());
        Ok(ApplyOutcome { before: None, after: Some(entity), status: ApplyStatus::Applied })
    }

    async fn apply_update(
        &self,
        descriptor: &dyn EntityDescriptor,
        key: &EntityKey,
        payload: Value,
        vector_clock: VectorClock,
        proposed_by: &str,
        proposed_at: OffsetDateTime,
    ) -> Result<ApplyOutcome> {
        let mut map = self.entities.lock().await;
        let existing = match map.get(key).cloned() {
            Some(existing) => existing,
            None => return Ok(ApplyOutcome { before: None, after: None, status: ApplyStatus::Stale }),
        };
        if existing.is_deleted() {
            return Ok(ApplyOutcome { before: Some(existing.clone()), after: Some(existing), status: ApplyStatus::Stale });
        }
        let before = existing.clone();
        let (after, status) = reconcile_update(descriptor, existing, payload, vector_clock, proposed_by, proposed_at)?;
        map.insert(key.clone(), after.clone());
        Ok(ApplyOutcome { before: Some(before), after: Some(after), status })
    }

    async fn apply_delete(
        &self,
        _descriptor: &dyn EntityDescriptor,
        key: &EntityKey,
        vector_clock: VectorClock,
        proposed_by: &str,
        proposed_at: OffsetDateTime,
    ) -> Result<ApplyOutcome> {
        let mut map = self.entities.lock().await;
        let existing = match map.get(key).cloned() {
            Some(existing) => existing,
            None => return Ok(ApplyOutcome { before: None, after: None, status: ApplyStatus::Stale }),
        };
        if existing.is_deleted() {
            return Ok(ApplyOutcome { before: Some(existing.clone()), after: Some(existing), status: ApplyStatus::Stale });
        }
        let before = existing.clone();
        let (after, status) = reconcile_delete(existing, vector_clock, proposed_by, proposed_at);
        map.insert(key.clone(), after.clone());
        Ok(ApplyOutcome { before: Some(before), after: Some(after), status })
    }

    async fn record_ledger_position(&self, key: &EntityKey, ledger_sequence: u64, ledger_event_id: Uuid) -> Result<()> {
        let mut map = self.entities.lock().await;
        if let Some(entity) = map.get_mut(key) {
            entity.ledger_sequence = Some(ledger_sequence);
            entity.last_ledger_event_id = Some(ledger_event_id);
        }
        Ok(())
    }

    async fn raw_rewrite(&self, key: &EntityKey, value: Value, migration_note: String) -> Result<()> {
        let mut map = self.entities.lock().await;
        if let Some(entity) = map.get_mut(key) {
            entity.value = value;
            entity.processing_log.push(migration_note);
        }
        Ok(())
    }
}

/// In-process [`SnapshotStore`]: one slot per entity key holding its most
/// recent snapshot, since a replay only ever wants the latest one at or
/// before its target version.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<EntityKey, EntitySnapshot>>,
}

impl InMemorySnapshotStore {
    /// A fresh, empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn latest_at_or_before(&self, key: &EntityKey, at_version: u64) -> Result<Option<EntitySnapshot>> {
        let snapshots = self.snapshots.lock().await;
        Ok(snapshots.get(key).filter(|s| s.version <= at_version).cloned())
    }

    async fn put(&self, snapshot: EntitySnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.lock().await;
        match snapshots.get(&snapshot.key) {
            Some(existing) if existing.version >= snapshot.version => {}
            _ => {
                snapshots.insert(snapshot.key.clone(), snapshot);
            }
        }
        Ok(())
    }
}
