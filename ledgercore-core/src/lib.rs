//! The process-wide `Core` handle: constructed once at startup and threaded
//! through request context, rather than module-level singleton services.
//!
//! `Core` is the one place every leaf crate gets wired together: tenants,
//! entity registry, vault, ledger, interceptor, journal, anchor store, and
//! the background orchestrator. It exposes exactly the five inbound
//! operations (write, read, verify, replay, proof) and the two outbound
//! hooks (broadcast, alert) as trait objects the caller supplies at
//! construction — `ledgercore-server` is the only code that constructs
//! one, and tests build a fresh `Core` per case.

#![deny(unsafe_code)]

pub mod tenant;

use ledgercore_anchor::{AnchorError, AnchorStore, MerkleAnchor};
use ledgercore_clock::VectorClock;
use ledgercore_entity::{Entity, EntityError, EntityRegistry, EntityStore};
use ledgercore_hash::ProofStep;
use ledgercore_interceptor::{Interceptor, InterceptorError, MutationContext, Operation};
use ledgercore_journal::{Journal, JournalEntry, JournalError, JournalOperation};
use ledgercore_ledger::{ChainVerification, EventMetadata, Ledger, LedgerError, LedgerEvent, TenantId};
use ledgercore_orchestrator::{AnchorTask, JournalDrainTask, Orchestrator, Schedule, TenantDirectory, VaultSweepTask};
use ledgercore_vault::{Vault, VaultError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

pub use tenant::{InMemoryTenantStore, PgTenantStore, Principal, Tenant, TenantError, TenantStatus, TenantStore};

/// The error taxonomy, aggregated from every leaf crate's own error enum.
/// Each variant carries structured context rather than a bare string.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input failed schema or policy validation; no state change.
    #[error("validation failed for {entity_type}.{field}: {reason}")]
    Validation { entity_type: String, field: String, reason: String },

    /// A journal reconcile produced CONFLICT; the entity is in its LWW
    /// state and the losing payload is retained for inspection.
    #[error("conflict resolving entity {entity_id}")]
    Conflict { entity_id: String, losing_payload: Value },

    /// A journal entry was superseded by a newer write; silently terminal.
    #[error("entry {entry_id} is stale")]
    Stale { entry_id: Uuid },

    /// The ledger chain or a Merkle anchor disagrees with recomputation.
    /// Fatal for the tenant's write path; reads stay available.
    #[error("integrity violation for tenant {tenant}: {detail}")]
    Integrity { tenant: TenantId, detail: String },

    /// A persistence/network blip, already retried by the caller.
    #[error(transparent)]
    TransientIo(#[from] sqlx::Error),

    /// Decryption failure or missing tenant key; never silently degrades
    /// to plaintext.
    #[error("cryptographic error: {detail}")]
    Cryptographic { detail: String },

    /// An unreachable branch or contract violation. Logged with full
    /// context; callers see only "internal error".
    #[error("internal error")]
    Programming { context: String },

    #[error("unknown entity type {0:?}")]
    UnknownEntityType(String),

    #[error("tenant {0} not found or inactive")]
    UnknownTenant(TenantId),
}

impl From<EntityError> for CoreError {
    fn from(e: EntityError) -> Self {
        match e {
            EntityError::Validation { entity_type, field, reason } => CoreError::Validation { entity_type, field, reason },
            EntityError::AlreadyExists(key) => CoreError::Programming { context: format!("{key:?} already exists") },
            EntityError::Delta(err) => CoreError::Programming { context: err.to_string() },
            EntityError::Storage(s) => CoreError::Programming { context: s },
        }
    }
}

impl From<LedgerError> for CoreError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Quarantined(tenant) => CoreError::Integrity { tenant, detail: "ledger quarantined".to_string() },
            other => CoreError::Programming { context: other.to_string() },
        }
    }
}

impl From<JournalError> for CoreError {
    fn from(e: JournalError) -> Self {
        CoreError::Programming { context: e.to_string() }
    }
}

impl From<InterceptorError> for CoreError {
    fn from(e: InterceptorError) -> Self {
        match e {
            InterceptorError::UnknownEntityType(t) => CoreError::UnknownEntityType(t),
            InterceptorError::Entity(err) => err.into(),
            InterceptorError::Ledger(err) => err.into(),
            InterceptorError::Vault(err) => err.into(),
            InterceptorError::Delta(err) => CoreError::Programming { context: err.to_string() },
        }
    }
}

impl From<VaultError> for CoreError {
    fn from(e: VaultError) -> Self {
        CoreError::Cryptographic { detail: e.to_string() }
    }
}

impl From<AnchorError> for CoreError {
    fn from(e: AnchorError) -> Self {
        CoreError::Programming { context: e.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Configuration recognized by the core, loaded from environment variables
/// the way `DATABASE_URL`/`PORT` are loaded — `std::env::var` with a
/// hardcoded default, no derive-based config crate.
#[derive(Debug, Clone)]
pub struct Config {
    /// `journal.drainIntervalMs` (default 30000).
    pub journal_drain_interval: Duration,
    /// `journal.batchSize` (default 50).
    pub journal_batch_size: usize,
    /// `journal.maxRetries` (default 5).
    pub journal_max_retries: u32,
    /// `anchor.cronExpr`, simplified to an interval here since this core
    /// has no cron parser dependency; the default below approximates
    /// "daily" for processes that stay up, and callers wanting an exact
    /// wall-clock schedule register their own `ScheduledTask`.
    pub anchor_interval: Duration,
    /// `vault.sweepCronExpr`, same simplification as `anchor_interval`.
    pub vault_sweep_interval: Duration,
    /// `vault.masterSecret` (required in production).
    pub vault_master_secret: Vec<u8>,
    /// `tenantParallelism` (default: CPU count).
    pub tenant_parallelism: usize,
    /// `ledger.quarantineOnCorruption`.
    pub quarantine_on_corruption: bool,
}

impl Config {
    /// Load from the environment, falling back to spec-mandated defaults
    /// for everything but `VAULT_MASTER_SECRET`, which has no safe default
    /// and must be set in production.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            journal_drain_interval: Duration::from_millis(env_u64("JOURNAL_DRAIN_INTERVAL_MS", 30_000)),
            journal_batch_size: env_u64("JOURNAL_BATCH_SIZE", 50) as usize,
            journal_max_retries: env_u64("JOURNAL_MAX_RETRIES", 5) as u32,
            anchor_interval: Duration::from_secs(env_u64("ANCHOR_INTERVAL_SECS", 86_400)),
            vault_sweep_interval: Duration::from_secs(env_u64("VAULT_SWEEP_INTERVAL_SECS", 86_400)),
            vault_master_secret: std::env::var("VAULT_MASTER_SECRET")
                .unwrap_or_else(|_| "dev-only-insecure-secret".to_string())
                .into_bytes(),
            tenant_parallelism: env_u64("TENANT_PARALLELISM", num_cpus()) as usize,
            quarantine_on_corruption: std::env::var("LEDGER_QUARANTINE_ON_CORRUPTION")
                .map(|v| v == "true")
                .unwrap_or(true),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn num_cpus() -> u64 {
    std::thread::available_parallelism().map(|n| n.get() as u64).unwrap_or(4)
}

/// An outbound notification of an applied mutation. Opaque to the core
/// beyond this shape — delivery across nodes is a collaborator's concern.
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    pub kind: BroadcastKind,
    pub tenant: TenantId,
    pub entity: Entity,
    pub ledger_sequence: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    Created,
    Updated,
    Deleted,
}

/// Sends [`BroadcastEvent`]s to an opaque pub-sub. The core never assumes
/// fan-out succeeded — a dropped broadcast does not roll back the
/// mutation it describes.
#[async_trait::async_trait]
pub trait Broadcast: Send + Sync {
    async fn publish(&self, event: BroadcastEvent);
}

/// The conditions that require an outbound alert.
#[derive(Debug, Clone)]
pub enum AlertReason {
    JournalEntryStuck { entry_id: Uuid, retry_count: u32 },
    ChainVerificationFailed { tenant: TenantId, first_corruption: u64 },
    AnchorMismatch { tenant: TenantId, detail: String },
}

/// Sends operator alerts for the conditions above. Separate from
/// [`Broadcast`] because alerts are operational, not domain events —
/// `ledgercore-server` commonly wires this to a different destination
/// (pager, ops channel) than the entity broadcast.
#[async_trait::async_trait]
pub trait Alert: Send + Sync {
    async fn notify(&self, reason: AlertReason);
}

/// A no-op [`Broadcast`]/[`Alert`] pair for tests and standalone use of the
/// core without wiring an external collaborator.
pub struct NoopSink;

#[async_trait::async_trait]
impl Broadcast for NoopSink {
    async fn publish(&self, _event: BroadcastEvent) {}
}

#[async_trait::async_trait]
impl Alert for NoopSink {
    async fn notify(&self, _reason: AlertReason) {}
}

/// A write request as it arrives from the glue layer.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub tenant: TenantId,
    pub author: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: JournalOperation,
    pub payload: Value,
    pub vector_clock: VectorClock,
    pub metadata: EventMetadata,
}

/// The optimistic acknowledgment returned from [`Core::write`]: the
/// journal entry id the caller can use to track eventual application.
#[derive(Debug, Clone)]
pub struct WriteAck {
    pub journal_entry_id: Uuid,
}

/// A read request. Filtering beyond "all live entities of this type" is a
/// glue-layer concern; the core's `EntityStore::find` contract only
/// guarantees tenant+type scoping.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub tenant: TenantId,
    pub entity_type: String,
}

/// A verification request.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub tenant: TenantId,
    pub start_seq: Option<u64>,
    pub end_seq: Option<u64>,
}

/// A proof request.
#[derive(Debug, Clone)]
pub struct ProofRequest {
    pub tenant: TenantId,
    pub event_id: Uuid,
}

/// The response to a proof request: the anchor's root, the inclusion
/// proof steps, and which anchor contains the event.
#[derive(Debug, Clone)]
pub struct ProofResponse {
    pub root_hash: String,
    pub proof: Vec<ProofStep>,
    pub containing_anchor: MerkleAnchor,
}

/// The response to a replay request: the reconstructed state and the
/// ordered history it was folded from.
#[derive(Debug, Clone)]
pub struct ReplayResponse {
    pub state: Value,
    pub history: Vec<LedgerEvent>,
}

/// The process-wide handle: everything a caller needs to run the core's
/// five inbound operations, one instance per process.
pub struct Core {
    tenants: Arc<dyn TenantStore>,
    registry: Arc<EntityRegistry>,
    entities: Arc<dyn EntityStore>,
    ledger: Arc<dyn Ledger>,
    journal: Arc<dyn Journal>,
    interceptor: Arc<Interceptor>,
    anchors: Arc<dyn AnchorStore>,
    broadcast: Arc<dyn Broadcast>,
    alert: Arc<dyn Alert>,
    config: Config,
}

impl Core {
    /// Assemble a `Core` from already-constructed storage layers. Callers
    /// (typically `ledgercore-server`'s startup) choose in-memory or
    /// Postgres-backed implementations per crate and pass them in here —
    /// this function does no I/O itself.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        registry: Arc<EntityRegistry>,
        entities: Arc<dyn EntityStore>,
        ledger: Arc<dyn Ledger>,
        journal: Arc<dyn Journal>,
        vault: Arc<Vault>,
        anchors: Arc<dyn AnchorStore>,
        broadcast: Arc<dyn Broadcast>,
        alert: Arc<dyn Alert>,
        config: Config,
    ) -> Self {
        let interceptor = Arc::new(Interceptor::new(entities.clone(), ledger.clone(), vault, registry.clone()));
        Self { tenants, registry, entities, ledger, journal, interceptor, anchors, broadcast, alert, config }
    }

    /// Wire a fresh in-memory `Core` for tests: every leaf crate's
    /// in-memory implementation, a `NoopSink` for broadcast/alert, and the
    /// given entity descriptors registered up front.
    pub fn in_memory(descriptors: Vec<Box<dyn ledgercore_entity::EntityDescriptor>>, config: Config) -> Self {
        let mut registry = EntityRegistry::new();
        for d in descriptors {
            registry.register(d);
        }
        let (tenants, _directory) = tenant::in_memory_pair();
        let vault = Arc::new(Vault::new(config.vault_master_secret.clone()));
        Self::new(
            tenants,
            Arc::new(registry),
            Arc::new(ledgercore_entity::memory::InMemoryEntityStore::new()),
            Arc::new(ledgercore_ledger::memory::InMemoryLedger::new()),
            Arc::new(ledgercore_journal::memory::InMemoryJournal::new()),
            vault,
            Arc::new(ledgercore_anchor::memory::InMemoryAnchorStore::new()),
            Arc::new(NoopSink),
            Arc::new(NoopSink),
            config,
        )
    }

    /// The tenant store, for callers (the server's tenant-admin routes)
    /// that need tenant CRUD beyond what the five core operations expose.
    pub fn tenants(&self) -> &Arc<dyn TenantStore> {
        &self.tenants
    }

    /// Enqueue a mutation and return immediately with status PENDING —
    /// never blocks on entity state.
    #[instrument(skip(self, request), fields(tenant = %request.tenant, entity_type = %request.entity_type))]
    pub async fn write(&self, request: WriteRequest) -> Result<WriteAck> {
        let tenant = self
            .tenants
            .get(&request.tenant)
            .await
            .map_err(|e| CoreError::Programming { context: e.to_string() })?
            .filter(Tenant::is_active)
            .ok_or_else(|| CoreError::UnknownTenant(request.tenant.clone()))?;
        let _ = tenant;

        if self.registry.get(&request.entity_type).is_none() {
            return Err(CoreError::UnknownEntityType(request.entity_type));
        }

        let entry = self
            .journal
            .enqueue(
                request.tenant,
                request.author,
                request.entity_type,
                request.entity_id,
                request.operation,
                request.payload,
                request.vector_clock,
                request.metadata,
            )
            .await?;

        Ok(WriteAck { journal_entry_id: entry.id })
    }

    /// All live entities of one type for one tenant. Filtering beyond type
    /// is a glue-layer concern.
    pub async fn read(&self, request: ReadRequest) -> Result<Vec<Entity>> {
        Ok(self.entities.find(&request.tenant.0, &request.entity_type).await?)
    }

    /// Recompute the hash chain over the requested range (or the full
    /// tenant range) and report the first break, if any. On a failure,
    /// raises an [`Alert`] for the chain verification failure.
    pub async fn verify(&self, request: VerificationRequest) -> Result<ChainVerification> {
        let result = self.ledger.verify_chain(&request.tenant, request.start_seq, request.end_seq).await?;
        if !result.valid {
            if let Some(seq) = result.first_corruption {
                self.alert
                    .notify(AlertReason::ChainVerificationFailed { tenant: request.tenant.clone(), first_corruption: seq })
                    .await;
                if self.config.quarantine_on_corruption {
                    self.ledger.quarantine(&request.tenant).await?;
                }
            }
        }
        Ok(result)
    }

    /// Reconstruct an entity's current state by folding its full ledger
    /// history — the authoritative replay function forensic tooling
    /// relies on.
    pub async fn replay(&self, tenant: &TenantId, entity_id: &str) -> Result<ReplayResponse> {
        let history = self.ledger.history_for(tenant, entity_id).await?;
        let mut versioned = Vec::with_capacity(history.len());
        for event in &history {
            versioned.push(ledgercore_delta::VersionedPayload { version: event.sequence, payload: event.payload.clone() });
        }
        let state = ledgercore_delta::reconstruct(Value::Object(Default::default()), versioned)
            .map_err(|e| CoreError::Programming { context: e.to_string() })?;
        Ok(ReplayResponse { state, history })
    }

    /// An inclusion proof for one ledger event against the Merkle anchor
    /// that covers it.
    pub async fn proof(&self, request: ProofRequest) -> Result<ProofResponse> {
        let event = self
            .ledger
            .find_by_id(&request.tenant, request.event_id)
            .await?
            .ok_or(CoreError::Programming { context: "event not found".to_string() })?;

        let anchors = self
            .anchors
            .history(&request.tenant)
            .await
            .map_err(CoreError::from)?;
        let anchor = anchors
            .into_iter()
            .find(|a| a.start_sequence <= event.sequence && event.sequence <= a.end_sequence)
            .ok_or(CoreError::Integrity { tenant: request.tenant.clone(), detail: "no anchor covers this event yet".to_string() })?;

        let (proof, root) = ledgercore_anchor::inclusion_proof(self.ledger.as_ref(), &request.tenant, &anchor, event.sequence)
            .await
            .map_err(CoreError::from)?;

        if hex::encode(root) != anchor.root_hash {
            self.alert
                .notify(AlertReason::AnchorMismatch { tenant: request.tenant.clone(), detail: "recomputed root disagrees with stored anchor".to_string() })
                .await;
            return Err(CoreError::Integrity { tenant: request.tenant, detail: "anchor root mismatch".to_string() });
        }

        Ok(ProofResponse { root_hash: anchor.root_hash.clone(), proof, containing_anchor: anchor })
    }

    /// Drain one batch of pending journal entries directly, bypassing the
    /// orchestrator's schedule — used by tests and the `verify-chain`
    /// binary's `--drain-once` mode. Emits a [`Broadcast`] for each entry
    /// that reached a terminal non-STALE state, and an [`Alert`] for any
    /// that exhausted retries into CONFLICT.
    pub async fn drain_once(&self, tenant: &TenantId, batch_size: usize) -> Result<Vec<JournalEntry>> {
        let drained = self.journal.drain(&self.interceptor, batch_size).await?;
        for entry in &drained {
            if &entry.tenant != tenant {
                continue;
            }
            if entry.status.is_terminal() && entry.status != ledgercore_journal::JournalStatus::Stale {
                if let Some(current) = self.entities.get(&ledgercore_entity::EntityKey {
                    tenant: entry.tenant.0.clone(),
                    entity_type: entry.entity_type.clone(),
                    entity_id: entry.entity_id.clone(),
                }).await? {
                    let kind = match entry.operation {
                        JournalOperation::Create => BroadcastKind::Created,
                        JournalOperation::Update => BroadcastKind::Updated,
                        JournalOperation::Delete => BroadcastKind::Deleted,
                    };
                    self.broadcast
                        .publish(BroadcastEvent {
                            kind,
                            tenant: entry.tenant.clone(),
                            entity: current.clone(),
                            ledger_sequence: current.ledger_sequence,
                        })
                        .await;
                }
            }
            if entry.retry_count >= self.config.journal_max_retries && entry.error_reason.is_some() {
                self.alert.notify(AlertReason::JournalEntryStuck { entry_id: entry.id, retry_count: entry.retry_count }).await;
            }
        }
        Ok(drained)
    }

    /// Apply one mutation directly through the interceptor, bypassing the
    /// journal entirely. Exposed for callers (the vault sweeper's peers,
    /// forensic repair tooling) that already hold a resolved
    /// [`MutationContext`]/[`Operation`] pair rather than a queued entry.
    pub async fn apply_direct(&self, ctx: MutationContext, operation: Operation) -> Result<ledgercore_interceptor::InterceptResult> {
        Ok(self.interceptor.apply(ctx, operation).await?)
    }

    /// Build the standard set of background schedules (journal drain,
    /// Merkle anchor, vault sweep) from this core's own storage handles,
    /// ready to hand to an [`Orchestrator`]. Callers that need additional
    /// cleaners push more [`Schedule`]s onto the returned vector before
    /// calling `Orchestrator::start`.
    pub fn default_schedules(&self, tenant_directory: Arc<dyn TenantDirectory>) -> Vec<Schedule> {
        vec![
            Schedule::new(
                Arc::new(JournalDrainTask::new(self.journal.clone(), self.interceptor.clone(), self.config.journal_batch_size)),
                self.config.journal_drain_interval,
            ),
            Schedule::new(
                Arc::new(AnchorTask::new(self.ledger.clone(), self.anchors.clone(), tenant_directory.clone())),
                self.config.anchor_interval,
            ),
            Schedule::new(
                Arc::new(VaultSweepTask::new(
                    self.entities.clone(),
                    self.registry.clone(),
                    Arc::new(Vault::new(self.config.vault_master_secret.clone())),
                    tenant_directory,
                )),
                self.config.vault_sweep_interval,
            ),
        ]
    }
}

/// Build and start the default set of background schedules for `core`
/// against an [`Orchestrator`] the caller owns the lifetime of.
pub fn start_background(orchestrator: &mut Orchestrator, core: &Core, tenant_directory: Arc<dyn TenantDirectory>) {
    orchestrator.start(core.default_schedules(tenant_directory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::OffsetDateTime;

    struct TxDescriptor;
    impl ledgercore_entity::EntityDescriptor for TxDescriptor {
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

    fn test_config() -> Config {
        Config {
            journal_drain_interval: Duration::from_millis(30_000),
            journal_batch_size: 50,
            journal_max_retries: 5,
            anchor_interval: Duration::from_secs(86_400),
            vault_sweep_interval: Duration::from_secs(86_400),
            vault_master_secret: b"test-secret".to_vec(),
            tenant_parallelism: 4,
            quarantine_on_corruption: true,
        }
    }

    async fn seeded_core() -> (Core, TenantId) {
        let core = Core::in_memory(vec![Box::new(TxDescriptor)], test_config());
        let tenant_id = TenantId("t1".to_string());
        core.tenants()
            .create(Tenant {
                id: tenant_id.clone(),
                name: "Acme".to_string(),
                status: TenantStatus::Active,
                owner: Principal { id: "alice".to_string(), display_name: None },
                parent_tenant: None,
                inherit_from_parent: false,
                settings: json!({}),
                created_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();
        (core, tenant_id)
    }

    #[tokio::test]
    async fn write_against_unknown_tenant_is_rejected() {
        let core = Core::in_memory(vec![Box::new(TxDescriptor)], test_config());
        let err = core
            .write(WriteRequest {
                tenant: TenantId("ghost".to_string()),
                author: "alice:dev1".to_string(),
                entity_type: "transaction".to_string(),
                entity_id: "tx1".to_string(),
                operation: JournalOperation::Create,
                payload: json!({"amount": 100}),
                vector_clock: [("alice:dev1".to_string(), 1)].into_iter().collect(),
                metadata: EventMetadata::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownTenant(_)));
    }

    #[tokio::test]
    async fn write_then_drain_then_read_round_trips() {
        let (core, tenant) = seeded_core().await;
        let ack = core
            .write(WriteRequest {
                tenant: tenant.clone(),
                author: "alice:dev1".to_string(),
                entity_type: "transaction".to_string(),
                entity_id: "tx1".to_string(),
                operation: JournalOperation::Create,
                payload: json!({"amount": 100}),
                vector_clock: [("alice:dev1".to_string(), 1)].into_iter().collect(),
                metadata: EventMetadata::default(),
            })
            .await
            .unwrap();
        assert!(core.journal.get(ack.journal_entry_id).await.unwrap().is_some());

        core.drain_once(&tenant, 10).await.unwrap();

        let rows = core.read(ReadRequest { tenant: tenant.clone(), entity_type: "transaction".to_string() }).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value["amount"], json!(100));

        let verified = core.verify(VerificationRequest { tenant, start_seq: None, end_seq: None }).await.unwrap();
        assert!(verified.valid);
    }

    #[tokio::test]
    async fn replay_reconstructs_state_from_ledger_history() {
        let (core, tenant) = seeded_core().await;
        core.write(WriteRequest {
            tenant: tenant.clone(),
            author: "alice:dev1".to_string(),
            entity_type: "transaction".to_string(),
            entity_id: "tx1".to_string(),
            operation: JournalOperation::Create,
            payload: json!({"amount": 100}),
            vector_clock: [("alice:dev1".to_string(), 1)].into_iter().collect(),
            metadata: EventMetadata::default(),
        })
        .await
        .unwrap();
        core.drain_once(&tenant, 10).await.unwrap();

        core.write(WriteRequest {
            tenant: tenant.clone(),
            author: "alice:dev1".to_string(),
            entity_type: "transaction".to_string(),
            entity_id: "tx1".to_string(),
            operation: JournalOperation::Update,
            payload: json!({"amount": 150}),
            vector_clock: [("alice:dev1".to_string(), 2)].into_iter().collect(),
            metadata: EventMetadata::default(),
        })
        .await
        .unwrap();
        core.drain_once(&tenant, 10).await.unwrap();

        let replay = core.replay(&tenant, "tx1").await.unwrap();
        assert_eq!(replay.history.len(), 2);
        assert_eq!(replay.state["amount"], json!(150));
    }

    #[tokio::test]
    async fn proof_request_fails_before_any_anchor_exists() {
        let (core, tenant) = seeded_core().await;
        core.write(WriteRequest {
            tenant: tenant.clone(),
            author: "alice:dev1".to_string(),
            entity_type: "transaction".to_string(),
            entity_id: "tx1".to_string(),
            operation: JournalOperation::Create,
            payload: json!({"amount": 100}),
            vector_clock: [("alice:dev1".to_string(), 1)].into_iter().collect(),
            metadata: EventMetadata::default(),
        })
        .await
        .unwrap();
        core.drain_once(&tenant, 10).await.unwrap();

        let event = core.ledger.find_last(&tenant).await.unwrap().unwrap();
        let err = core.proof(ProofRequest { tenant: tenant.clone(), event_id: event.id }).await.unwrap_err();
        assert!(matches!(err, CoreError::Integrity { .. }));
    }

    #[tokio::test]
    async fn proof_request_succeeds_after_anchoring() {
        let (core, tenant) = seeded_core().await;
        core.write(WriteRequest {
            tenant: tenant.clone(),
            author: "alice:dev1".to_string(),
            entity_type: "transaction".to_string(),
            entity_id: "tx1".to_string(),
            operation: JournalOperation::Create,
            payload: json!({"amount": 100}),
            vector_clock: [("alice:dev1".to_string(), 1)].into_iter().collect(),
            metadata: EventMetadata::default(),
        })
        .await
        .unwrap();
        core.drain_once(&tenant, 10).await.unwrap();

        ledgercore_anchor::run_for_tenant(core.ledger.as_ref(), core.anchors.as_ref(), &tenant).await.unwrap();

        let event = core.ledger.find_last(&tenant).await.unwrap().unwrap();
        let proof = core.proof(ProofRequest { tenant: tenant.clone(), event_id: event.id }).await.unwrap();
        assert_eq!(proof.containing_anchor.start_sequence, 1);
    }
}
