//! Postgres-backed [`EntityStore`]. Entities of every descriptor share one
//! `entity` table, keyed by `(tenant, entity_type, entity_id)`, with the
//! schema-specific value stored as `jsonb` — the financial domain's entity
//! set is configured at runtime via [`crate::EntityRegistry`], not fixed at
//! compile time, so one generic table covers every entity type instead of
//! a table per type.

use crate::{
    reconcile_delete, reconcile_update, ApplyOutcome, ApplyStatus, Entity, EntityDescriptor,
    EntityError, EntityKey, EntitySnapshot, EntityStore, Result, SnapshotStore,
};
use ledgercore_clock::VectorClock;
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

/// A Postgres-backed [`EntityStore`].
#[derive(Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entity(row: &PgRow) -> Result<Entity> {
        let vector_clock_json: Value = row.try_get("vector_clock").map_err(storage_err)?;
        let vector_clock: VectorClock = serde_json::from_value(vector_clock_json).unwrap_or_default();
        let conflicts_json: Value = row.try_get("conflicts").map_err(storage_err)?;
        let conflicts = serde_json::from_value(conflicts_json).unwrap_or_default();
        let processing_log_json: Value = row.try_get("processing_log").map_err(storage_err)?;
        let processing_log = serde_json::from_value(processing_log_json).unwrap_or_default();

        Ok(Entity {
            id: row.try_get("id").map_err(storage_err)?,
            key: EntityKey {
                tenant: row.try_get("tenant").map_err(storage_err)?,
                entity_type: row.try_get("entity_type").map_err(storage_err)?,
                entity_id: row.try_get("entity_id").map_err(storage_err)?,
            },
            value: row.try_get("value").map_err(storage_err)?,
            version: row.try_get::<i64, _>("version").map_err(storage_err)? as u64,
            vector_clock,
            conflicts,
            ledger_sequence: row.try_get::<Option<i64>, _>("ledger_sequence").map_err(storage_err)?.map(|v| v as u64),
            last_ledger_event_id: row.try_get("last_ledger_event_id").map_err(storage_err)?,
            deleted_at: row.try_get("deleted_at").map_err(storage_err)?,
            processing_log,
            last_write_at: row.try_get("last_write_at").map_err(storage_err)?,
        })
    }

    async fn load_for_update(tx: &mut Transaction<'_, Postgres>, key: &EntityKey) -> Result<Option<Entity>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT * FROM entity
            WHERE tenant = $1 AND entity_type = $2 AND entity_id = $3
            FOR UPDATE
            "#,
        )
        .bind(&key.tenant)
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(Self::row_to_entity).transpose()
    }

    async fn persist(tx: &mut Transaction<'_, Postgres>, entity: &Entity) -> Result<()> {
        let vector_clock_json = serde_json::to_value(&entity.vector_clock).unwrap_or(Value::Null);
        let conflicts_json = serde_json::to_value(&entity.conflicts).unwrap_or(Value::Null);
        let processing_log_json = serde_json::to_value(&entity.processing_log).unwrap_or(Value::Null);

        sqlx::query(
            r#"
            INSERT INTO entity
                (id, tenant, entity_type, entity_id, value, version, vector_clock, conflicts,
                 ledger_sequence, last_ledger_event_id, deleted_at, processing_log, last_write_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (tenant, entity_type, entity_id) DO UPDATE SET
                value = EXCLUDED.value,
                version = EXCLUDED.version,
                vector_clock = EXCLUDED.vector_clock,
                conflicts = EXCLUDED.conflicts,
                ledger_sequence = EXCLUDED.ledger_sequence,
                last_ledger_event_id = EXCLUDED.last_ledger_event_id,
                deleted_at = EXCLUDED.deleted_at,
                processing_log = EXCLUDED.processing_log,
                last_write_at = EXCLUDED.last_write_at
            "#,
        )
        .bind(entity.id)
        .bind(&entity.key.tenant)
        .bind(&entity.key.entity_type)
        .bind(&entity.key.entity_id)
        .bind(&entity.value)
        .bind(entity.version as i64)
        .bind(&vector_clock_json)
        .bind(&conflicts_json)
        .bind(entity.ledger_sequence.map(|s| s as i64))
        .bind(entity.last_ledger_event_id)
        .bind(entity.deleted_at)
        .bind(&processing_log_json)
        .bind(entity.last_write_at)
        .execute(&mut **tx)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

fn storage_err(e: sqlx::Error) -> EntityError {
    EntityError::Storage(e.to_string())
}

#[async_trait::async_trait]
impl EntityStore for PgEntityStore {
    async fn get(&self, key: &EntityKey) -> Result<Option<Entity>> {
        let row: Option<PgRow> = sqlx::query(
            "SELECT * FROM entity WHERE tenant = $1 AND entity_type = $2 AND entity_id = $3",
        )
        .bind(&key.tenant)
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(Self::row_to_entity).transpose()
    }

    async fn find(&self, tenant: &str, entity_type: &str) -> Result<Vec<Entity>> {
        let rows: Vec<PgRow> = sqlx::query(
            "SELECT * FROM entity WHERE tenant = $1 AND entity_type = $2 AND deleted_at IS NULL",
        )
        .bind(tenant)
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_entity).collect()
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
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        if let Some(existing) = Self::load_for_update(&mut tx, &key).await? {
            return Ok(ApplyOutcome { before: Some(existing.clone()), after: Some(existing), status: ApplyStatus::Stale });
        }

        let entity = Entity {
            id: Uuid::new_v4(),
            key,
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
        Self::persist(&mut tx, &entity).await?;
        tx.commit().await.map_err(storage_err)?;
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
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let existing = match Self::load_for_update(&mut tx, key).await? {
            Some(existing) => existing,
            None => return Ok(ApplyOutcome { before: None, after: None, status: ApplyStatus::Stale }),
        };

        if existing.is_deleted() {
            return Ok(ApplyOutcome { before: Some(existing.clone()), after: Some(existing), status: ApplyStatus::Stale });
        }

        let before = existing.clone();
        let (after, status) = reconcile_update(descriptor, existing, payload, vector_clock, proposed_by, proposed_at)?;
        Self::persist(&mut tx, &after).await?;
        tx.commit().await.map_err(storage_err)?;
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
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let existing = match Self::load_for_update(&mut tx, key).await? {
            Some(existing) => existing,
            None => return Ok(ApplyOutcome { before: None, after: None, status: ApplyStatus::Stale }),
        };

        if existing.is_deleted() {
            return Ok(ApplyOutcome { before: Some(existing.clone()), after: Some(existing), status: ApplyStatus::Stale });
        }

        let before = existing.clone();
        let (after, status) = reconcile_delete(existing, vector_clock, proposed_by, proposed_at);
        Self::persist(&mut tx, &after).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(ApplyOutcome { before: Some(before), after: Some(after), status })
    }

    async fn record_ledger_position(&self, key: &EntityKey, ledger_sequence: u64, ledger_event_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE entity SET ledger_sequence = $4, last_ledger_event_id = $5
            WHERE tenant = $1 AND entity_type = $2 AND entity_id = $3
            "#,
        )
        .bind(&key.tenant)
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .bind(ledger_sequence as i64)
        .bind(ledger_event_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn raw_rewrite(&self, key: &EntityKey, value: Value, migration_note: String) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE entity SET value = $4,
                processing_log = COALESCE(processing_log, '[]'::jsonb) || to_jsonb(ARRAY[$5])
            WHERE tenant = $1 AND entity_type = $2 AND entity_id = $3
            "#,
        )
        .bind(&key.tenant)
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .bind(&value)
        .bind(&migration_note)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

/// A Postgres-backed [`SnapshotStore`], one `entity_snapshot` row per
/// `(tenant, entity_type, entity_id)` holding only the latest generation —
/// replay never wants an older one, so there is nothing to keep around.
#[derive(Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn latest_at_or_before(&self, key: &EntityKey, at_version: u64) -> Result<Option<EntitySnapshot>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT * FROM entity_snapshot
            WHERE tenant = $1 AND entity_type = $2 AND entity_id = $3 AND version <= $4
            "#,
        )
        .bind(&key.tenant)
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .bind(at_version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(|r| {
            Ok(EntitySnapshot {
                key: EntityKey {
                    tenant: r.try_get("tenant").map_err(storage_err)?,
                    entity_type: r.try_get("entity_type").map_err(storage_err)?,
                    entity_id: r.try_get("entity_id").map_err(storage_err)?,
                },
                version: r.try_get::<i64, _>("version").map_err(storage_err)? as u64,
                value: r.try_get("value").map_err(storage_err)?,
            })
        })
        .transpose()
    }

    async fn put(&self, snapshot: EntitySnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entity_snapshot (tenant, entity_type, entity_id, version, value)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant, entity_type, entity_id) DO UPDATE SET
                version = EXCLUDED.version,
                value = EXCLUDED.value
            WHERE entity_snapshot.version < EXCLUDED.version
            "#,
        )
        .bind(&snapshot.key.tenant)
        .bind(&snapshot.key.entity_type)
        .bind(&snapshot.key.entity_id)
        .bind(snapshot.version as i64)
        .bind(&snapshot.value)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}
