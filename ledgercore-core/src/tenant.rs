//! Tenants and principals (spec §3 Data model): the isolation unit every
//! ledger, journal, and entity is scoped by, and the opaque identity that
//! authors a mutation.
//!
//! The teacher's `tenant/types.rs` calls this "workspace"; we keep its
//! `status`/settings shape but rename to `Tenant` since the financial domain
//! has no notion of a "container" (see the `TenantId` newtype in
//! `ledgercore-ledger`, the same REDESIGN FLAG applied one layer down).

use async_trait::async_trait;
use ledgercore_ledger::TenantId;
use ledgercore_orchestrator::TenantDirectory;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;

/// A user identity, opaque to the core except as author attribution on
/// journal entries and ledger events (spec §3: "opaque to the core except
/// as an author attribution").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub display_name: Option<String>,
}

/// Whether a tenant currently accepts writes (`Active`) or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Archived,
}

impl Default for TenantStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// The isolation unit all ledger, journal, and entity state is scoped by
/// (spec §3 Tenant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub status: TenantStatus,
    pub owner: Principal,
    /// An optional parent tenant this one inherits configuration from
    /// (spec §3: "hierarchy (optional parent tenant) with inheritance
    /// flag"). Inheritance semantics beyond carrying the flag are an
    /// application-level concern outside the core.
    pub parent_tenant: Option<TenantId>,
    pub inherit_from_parent: bool,
    pub settings: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

/// Errors from tenant storage.
#[derive(Debug, Error)]
pub enum TenantError {
    #[error("tenant {0} not found")]
    NotFound(TenantId),

    #[error("tenant {0} already exists")]
    AlreadyExists(TenantId),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, TenantError>;

/// CRUD over tenants. Separate from [`TenantDirectory`] (which only needs
/// to enumerate active tenants for the background schedules) so that the
/// orchestrator crate stays ignorant of the full tenant lifecycle.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get(&self, id: &TenantId) -> Result<Option<Tenant>>;
    async fn create(&self, tenant: Tenant) -> Result<Tenant>;
    async fn set_status(&self, id: &TenantId, status: TenantStatus) -> Result<()>;
    async fn list_active(&self) -> Result<Vec<Tenant>>;
}

/// In-process tenant store, for tests and single-node experimentation.
#[derive(Default)]
pub struct InMemoryTenantStore {
    tenants: Mutex<HashMap<TenantId, Tenant>>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn get(&self, id: &TenantId) -> Result<Option<Tenant>> {
        Ok(self.tenants.lock().await.get(id).cloned())
    }

    async fn create(&self, tenant: Tenant) -> Result<Tenant> {
        let mut tenants = self.tenants.lock().await;
        if tenants.contains_key(&tenant.id) {
            return Err(TenantError::AlreadyExists(tenant.id));
        }
        tenants.insert(tenant.id.clone(), tenant.clone());
        Ok(tenant)
    }

    async fn set_status(&self, id: &TenantId, status: TenantStatus) -> Result<()> {
        let mut tenants = self.tenants.lock().await;
        let tenant = tenants.get_mut(id).ok_or_else(|| TenantError::NotFound(id.clone()))?;
        tenant.status = status;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Tenant>> {
        Ok(self.tenants.lock().await.values().filter(|t| t.is_active()).cloned().collect())
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantStore {
    async fn active_tenants(&self) -> Vec<TenantId> {
        self.tenants.lock().await.values().filter(|t| t.is_active()).map(|t| t.id.clone()).collect()
    }
}

/// Postgres-backed tenant store, one `tenant` row per tenant.
#[derive(Clone)]
pub struct PgTenantStore {
    pool: PgPool,
}

impl PgTenantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_tenant(row: &PgRow) -> Result<Tenant> {
        let status_raw: String = row.try_get("status").map_err(storage_err)?;
        let status = match status_raw.as_str() {
            "active" => TenantStatus::Active,
            "suspended" => TenantStatus::Suspended,
            _ => TenantStatus::Archived,
        };
        Ok(Tenant {
            id: TenantId(row.try_get("id").map_err(storage_err)?),
            name: row.try_get("name").map_err(storage_err)?,
            status,
            owner: Principal {
                id: row.try_get("owner_id").map_err(storage_err)?,
                display_name: row.try_get("owner_display_name").map_err(storage_err)?,
            },
            parent_tenant: row.try_get::<Option<String>, _>("parent_tenant_id").map_err(storage_err)?.map(TenantId),
            inherit_from_parent: row.try_get("inherit_from_parent").map_err(storage_err)?,
            settings: row.try_get("settings").map_err(storage_err)?,
            created_at: row.try_get("created_at").map_err(storage_err)?,
        })
    }
}

fn storage_err(e: sqlx::Error) -> TenantError {
    TenantError::Storage(e.to_string())
}

#[async_trait]
impl TenantStore for PgTenantStore {
    async fn get(&self, id: &TenantId) -> Result<Option<Tenant>> {
        let row: Option<PgRow> = sqlx::query("SELECT * FROM tenant WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(Self::row_to_tenant).transpose()
    }

    async fn create(&self, tenant: Tenant) -> Result<Tenant> {
        let status_str = match tenant.status {
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Archived => "archived",
        };
        sqlx::query(
            r#"
            INSERT INTO tenant
                (id, name, status, owner_id, owner_display_name, parent_tenant_id,
                 inherit_from_parent, settings, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&tenant.id.0)
        .bind(&tenant.name)
        .bind(status_str)
        .bind(&tenant.owner.id)
        .bind(&tenant.owner.display_name)
        .bind(tenant.parent_tenant.as_ref().map(|t| &t.0))
        .bind(tenant.inherit_from_parent)
        .bind(&tenant.settings)
        .bind(tenant.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(tenant)
    }

    async fn set_status(&self, id: &TenantId, status: TenantStatus) -> Result<()> {
        let status_str = match status {
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Archived => "archived",
        };
        sqlx::query("UPDATE tenant SET status = $2 WHERE id = $1")
            .bind(&id.0)
            .bind(status_str)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Tenant>> {
        let rows: Vec<PgRow> = sqlx::query("SELECT * FROM tenant WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(Self::row_to_tenant).collect()
    }
}

#[async_trait]
impl TenantDirectory for PgTenantStore {
    async fn active_tenants(&self) -> Vec<TenantId> {
        self.list_active().await.unwrap_or_default().into_iter().map(|t| t.id).collect()
    }
}

/// Either tenant store wrapped as a [`TenantDirectory`], for callers that
/// already hold an `Arc<dyn TenantStore>` and want the matching directory
/// handle without constructing a second concrete store. Neither
/// [`InMemoryTenantStore`] nor [`PgTenantStore`] can be upcast from
/// `Arc<dyn TenantStore>` to `Arc<dyn TenantDirectory>` directly, so
/// `ledgercore-core`'s builder keeps both trait objects side by side,
/// constructed from the same concrete store.
pub fn in_memory_pair() -> (Arc<InMemoryTenantStore>, Arc<dyn TenantDirectory>) {
    let store = Arc::new(InMemoryTenantStore::new());
    let directory: Arc<dyn TenantDirectory> = store.clone();
    (store, directory)
}
