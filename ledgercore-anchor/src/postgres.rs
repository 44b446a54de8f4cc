//! Postgres-backed [`AnchorStore`]. Expected schema (see `migrations/` at
//! the server crate): a `merkle_anchor` table keyed by `id`, with a
//! `(tenant_id, start_sequence)` unique index.

use crate::{AnchorError, AnchorStore, MerkleAnchor, Result};
use ledgercore_ledger::TenantId;
use sqlx::{postgres::PgRow, PgPool, Row};

/// A Postgres-backed [`AnchorStore`].
#[derive(Clone)]
pub struct PgAnchorStore {
    pool: PgPool,
}

impl PgAnchorStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_anchor(row: &PgRow) -> Result<MerkleAnchor> {
        Ok(MerkleAnchor {
            id: row.try_get("id").map_err(storage_err)?,
            tenant: TenantId(row.try_get("tenant_id").map_err(storage_err)?),
            start_sequence: row.try_get::<i64, _>("start_sequence").map_err(storage_err)? as u64,
            end_sequence: row.try_get::<i64, _>("end_sequence").map_err(storage_err)? as u64,
            root_hash: row.try_get("root_hash").map_err(storage_err)?,
            prev_root_hash: row.try_get("prev_root_hash").map_err(storage_err)?,
            event_count: row.try_get::<i64, _>("event_count").map_err(storage_err)? as u64,
            tree_depth: row.try_get::<i32, _>("tree_depth").map_err(storage_err)? as u32,
            verified: row.try_get("verified").map_err(storage_err)?,
            created_at: row.try_get("created_at").map_err(storage_err)?,
        })
    }
}

fn storage_err(e: sqlx::Error) -> AnchorError {
    AnchorError::Storage(e.to_string())
}

#[async_trait::async_trait]
impl AnchorStore for PgAnchorStore {
    async fn last_anchor(&self, tenant: &TenantId) -> Result<Option<MerkleAnchor>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT * FROM merkle_anchor
            WHERE tenant_id = $1
            ORDER BY start_sequence DESC
            LIMIT 1
            "#,
        )
        .bind(&tenant.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(Self::row_to_anchor).transpose()
    }

    async fn append(&self, anchor: MerkleAnchor) -> Result<MerkleAnchor> {
        sqlx::query(
            r#"
            INSERT INTO merkle_anchor
                (id, tenant_id, start_sequence, end_sequence, root_hash, prev_root_hash,
                 event_count, tree_depth, verified, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(anchor.id)
        .bind(&anchor.tenant.0)
        .bind(anchor.start_sequence as i64)
        .bind(anchor.end_sequence as i64)
        .bind(&anchor.root_hash)
        .bind(&anchor.prev_root_hash)
        .bind(anchor.event_count as i64)
        .bind(anchor.tree_depth as i32)
        .bind(anchor.verified)
        .bind(anchor.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(anchor)
    }

    async fn history(&self, tenant: &TenantId) -> Result<Vec<MerkleAnchor>> {
        let rows: Vec<PgRow> = sqlx::query(
            "SELECT * FROM merkle_anchor WHERE tenant_id = $1 ORDER BY start_sequence ASC",
        )
        .bind(&tenant.0)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(Self::row_to_anchor).collect()
    }
}
