//! Postgres-backed [`Ledger`]. Appends run inside a `SERIALIZABLE`
//! transaction that locks the tenant's chain head with `SELECT ... FOR
//! UPDATE`, the same pattern `ubl-server`'s database layer uses to keep a
//! single hash chain consistent under concurrent writers.
//!
//! Queries are written with `sqlx::query` rather than the `query!` macro so
//! this crate builds without a live `DATABASE_URL` or a checked offline
//! cache.

use crate::{
    verify_events, ChainVerification, EntityRef, EventMetadata, Ledger, LedgerError, LedgerEvent,
    LedgerEventType, Result, TenantId,
};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

/// Expected schema (see `migrations/` at the server crate): a
/// `ledger_event` table keyed by `(tenant_id, sequence)`, and a
/// `ledger_head` table carrying one `quarantined` flag per tenant.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Wrap an existing pool. The caller owns pool lifecycle and migrations.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn row_to_event(row: &PgRow) -> Result<LedgerEvent> {
        let event_type_raw: String = row.try_get("event_type").map_err(storage_err)?;
        let event_type = match event_type_raw.as_str() {
            "CREATED" => LedgerEventType::Created,
            "UPDATED" => LedgerEventType::Updated,
            "DELETED" => LedgerEventType::Deleted,
            other => LedgerEventType::Custom(other.to_string()),
        };

        let metadata_raw: serde_json::Value = row.try_get("metadata").map_err(storage_err)?;
        let metadata: EventMetadata = serde_json::from_value(metadata_raw).unwrap_or_default();

        Ok(LedgerEvent {
            id: row.try_get("id").map_err(storage_err)?,
            tenant: TenantId(row.try_get("tenant_id").map_err(storage_err)?),
            sequence: row.try_get::<i64, _>("sequence").map_err(storage_err)? as u64,
            event_type,
            entity: EntityRef {
                entity_type: row.try_get("entity_type").map_err(storage_err)?,
                entity_id: row.try_get("entity_id").map_err(storage_err)?,
            },
            payload: row.try_get("payload").map_err(storage_err)?,
            author: row.try_get("author").map_err(storage_err)?,
            previous_event_id: row.try_get("previous_event_id").map_err(storage_err)?,
            previous_hash: row.try_get("previous_hash").map_err(storage_err)?,
            current_hash: row.try_get("current_hash").map_err(storage_err)?,
            metadata,
            created_at: row.try_get("created_at").map_err(storage_err)?,
        })
    }
}

fn storage_err(e: sqlx::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

#[async_trait::async_trait]
impl Ledger for PgLedger {
    async fn append(
        &self,
        tenant: &TenantId,
        entity: EntityRef,
        event_type: LedgerEventType,
        payload: serde_json::Value,
        author: &str,
        metadata: EventMetadata,
    ) -> Result<LedgerEvent> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        let quarantined: Option<bool> = sqlx::query_scalar(
            "SELECT quarantined FROM ledger_head WHERE tenant_id = $1 FOR UPDATE",
        )
        .bind(&tenant.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;

        if quarantined.unwrap_or(false) {
            return Err(LedgerError::Quarantined(tenant.clone()));
        }

        let head: Option<PgRow> = sqlx::query(
            r#"
            SELECT id, sequence, current_hash
            FROM ledger_event
            WHERE tenant_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(&tenant.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;

        let (previous_event_id, previous_hash, sequence) = match &head {
            Some(row) => {
                let id: Uuid = row.try_get("id").map_err(storage_err)?;
                let hash: String = row.try_get("current_hash").map_err(storage_err)?;
                let seq: i64 = row.try_get("sequence").map_err(storage_err)?;
                (Some(id), hash, seq as u64 + 1)
            }
            None => (None, ledgercore_hash::GENESIS_SENTINEL.to_string(), 1),
        };

        let current_hash = ledgercore_hash::h_event(&payload, &previous_hash, sequence)?;
        let id = Uuid::new_v4();
        let created_at = OffsetDateTime::now_utc();
        let metadata_json = serde_json::to_value(&metadata).unwrap_or(serde_json::Value::Null);
        let event_type_str = event_type.to_string();

        sqlx::query(
            r#"
            INSERT INTO ledger_event
                (id, tenant_id, sequence, event_type, entity_type, entity_id, payload,
                 author, previous_event_id, previous_hash, current_hash, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(id)
        .bind(&tenant.0)
        .bind(sequence as i64)
        .bind(&event_type_str)
        .bind(&entity.entity_type)
        .bind(&entity.entity_id)
        .bind(&payload)
        .bind(author)
        .bind(previous_event_id)
        .bind(&previous_hash)
        .bind(&current_hash)
        .bind(&metadata_json)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            INSERT INTO ledger_head (tenant_id, quarantined)
            VALUES ($1, false)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(&tenant.0)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;

        Ok(LedgerEvent {
            id,
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
            created_at,
        })
    }

    async fn find_last(&self, tenant: &TenantId) -> Result<Option<LedgerEvent>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT * FROM ledger_event
            WHERE tenant_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(&tenant.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(r) => Ok(Some(Self::row_to_event(&r).await?)),
            None => Ok(None),
        }
    }

    async fn range(&self, tenant: &TenantId, start_seq: u64, end_seq: u64) -> Result<Vec<LedgerEvent>> {
        if start_seq > end_seq {
            return Err(LedgerError::InvalidRange { start: start_seq, end: end_seq });
        }
        let rows: Vec<PgRow> = sqlx::query(
            r#"
            SELECT * FROM ledger_event
            WHERE tenant_id = $1 AND sequence BETWEEN $2 AND $3
            ORDER BY sequence ASC
            "#,
        )
        .bind(&tenant.0)
        .bind(start_seq as i64)
        .bind(end_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(Self::row_to_event(row).await?);
        }
        Ok(out)
    }

    async fn history_for(&self, tenant: &TenantId, entity_id: &str) -> Result<Vec<LedgerEvent>> {
        let rows: Vec<PgRow> = sqlx::query(
            r#"
            SELECT * FROM ledger_event
            WHERE tenant_id = $1 AND entity_id = $2
            ORDER BY sequence ASC
            "#,
        )
        .bind(&tenant.0)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(Self::row_to_event(row).await?);
        }
        Ok(out)
    }

    async fn find_by_id(&self, tenant: &TenantId, event_id: Uuid) -> Result<Option<LedgerEvent>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT * FROM ledger_event
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(&tenant.0)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(r) => Ok(Some(Self::row_to_event(&r).await?)),
            None => Ok(None),
        }
    }

    async fn verify_chain(
        &self,
        tenant: &TenantId,
        start_seq: Option<u64>,
        end_seq: Option<u64>,
    ) -> Result<ChainVerification> {
        let end = match end_seq {
            Some(e) => e,
            None => {
                match self.find_last(tenant).await? {
                    Some(last) => last.sequence,
                    None => {
                        return Ok(ChainVerification {
                            valid: true,
                            first_corruption: None,
                        })
                    }
                }
            }
        };
        let start = start_seq.unwrap_or(1);
        let events = self.range(tenant, start, end).await?;
        verify_events(&events)
    }

    async fn is_quarantined(&self, tenant: &TenantId) -> Result<bool> {
        let quarantined: Option<bool> =
            sqlx::query_scalar("SELECT quarantined FROM ledger_head WHERE tenant_id = $1")
                .bind(&tenant.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
        Ok(quarantined.unwrap_or(false))
    }

    async fn quarantine(&self, tenant: &TenantId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_head (tenant_id, quarantined)
            VALUES ($1, true)
            ON CONFLICT (tenant_id) DO UPDATE SET quarantined = true
            "#,
        )
        .bind(&tenant.0)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn repair(&self, tenant: &TenantId) -> Result<()> {
        sqlx::query("UPDATE ledger_head SET quarantined = false WHERE tenant_id = $1")
            .bind(&tenant.0)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
