//! Typed entity projections and the CREATE/UPDATE/DELETE apply algorithm:
//! load, branch on operation, and — for UPDATE/DELETE — reconcile against
//! the entity's vector clock.
//!
//! This crate does not itself emit ledger events or touch the vault; those
//! are [`ledgercore-interceptor`]'s job, which wraps an [`EntityStore`] and
//! reacts to the [`ApplyOutcome`] this crate produces.

#![deny(unsafe_code)]

pub mod memory;
pub mod postgres;

use ledgercore_clock::{ConflictPolicy, VectorClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// A tenant-and-type-scoped entity identifier, as carried by journal entries
/// and ledger event entity refs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Tenant id, as a bare string (the entity crate is tenant-agnostic by
    /// design; `ledgercore-core` owns the `TenantId` newtype at the API
    /// boundary).
    pub tenant: String,
    /// Entity type name (e.g. `"transaction"`).
    pub entity_type: String,
    /// Entity identifier, unique within `(tenant, entity_type)`.
    pub entity_id: String,
}

/// A single losing write retained for operator inspection after a CONFLICT
/// resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// The actor whose write lost.
    pub device_id: String,
    /// When the losing write was proposed.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// The losing payload.
    pub payload: Value,
}

/// A managed domain object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Identifier, stable for the entity's lifetime.
    pub id: Uuid,
    /// Tenant/type/id triple.
    pub key: EntityKey,
    /// Current schema-specific value.
    pub value: Value,
    /// Monotonic version, starts at 1 on CREATE and increments on every
    /// successful mutation (including CONFLICT).
    pub version: u64,
    /// Causality map, advanced on every successful mutation.
    pub vector_clock: VectorClock,
    /// Losing writes from CONFLICT resolutions, newest last.
    pub conflicts: Vec<ConflictRecord>,
    /// Latest ledger sequence at last mutation, if the interceptor has run.
    pub ledger_sequence: Option<u64>,
    /// The ledger event id of the last mutation, if the interceptor has run.
    pub last_ledger_event_id: Option<Uuid>,
    /// Soft-delete marker; `None` while live.
    pub deleted_at: Option<OffsetDateTime>,
    /// Operator-facing log of out-of-band corrections to this entity that
    /// did not go through the interceptor — the vault sweeper appends a
    /// `MIGRATION` line here instead of emitting a ledger event.
    pub processing_log: Vec<String>,
    /// Wall-clock of the last successful CREATE/APPLY/CONFLICT mutation.
    /// The real `current_ts` fed to [`ConflictPolicy::resolve`] on the next
    /// concurrent write — distinct from `vector_clock`, which tracks
    /// causality, not time.
    #[serde(with = "time::serde::rfc3339")]
    pub last_write_at: OffsetDateTime,
}

impl Entity {
    /// Whether this entity has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Declares the shape and policy for one entity type.
pub trait EntityDescriptor: Send + Sync {
    /// The entity type name this descriptor governs.
    fn entity_type(&self) -> &'static str;

    /// Top-level keys that must transit the vault hook before being
    /// persisted.
    fn sensitive_keys(&self) -> &'static [&'static str] {
        &[]
    }

    /// Validate a candidate value before it is persisted.
    fn validate(&self, value: &Value) -> Result<()>;

    /// The conflict policy used to resolve concurrent writes to this
    /// entity type. Defaults to [`ledgercore_clock::LastWriterWins`].
    fn conflict_policy(&self) -> Box<dyn ConflictPolicy + Send + Sync> {
        Box::new(ledgercore_clock::LastWriterWins)
    }

    /// How often forensic replay should consult a [`SnapshotStore`] instead
    /// of folding the full history: every `N` versions, or never (`None`,
    /// the default) for entity types whose history stays short. Does not
    /// change what `reconstruct` computes, only where its caller starts —
    /// the function remains authoritative either way.
    fn snapshot_every(&self) -> Option<u64> {
        None
    }
}

/// A point-in-time projection of an entity's value, used to bound forensic
/// replay cost for long-lived entities. `reconstruct` is still the
/// authoritative fold; a snapshot only changes where that fold starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// The entity this snapshot projects.
    pub key: EntityKey,
    /// The entity `version` this snapshot was taken at.
    pub version: u64,
    /// The entity's value at `version`.
    pub value: Value,
}

/// Durable storage for [`EntitySnapshot`]s, one store shared across entity
/// types. Implementations need only ever return the single most useful
/// snapshot for a replay — the latest one at or before the requested
/// version.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The most recent snapshot for `key` with `version <= at_version`, if
    /// any.
    async fn latest_at_or_before(&self, key: &EntityKey, at_version: u64) -> Result<Option<EntitySnapshot>>;

    /// Persist a snapshot, superseding any earlier one for the same key.
    async fn put(&self, snapshot: EntitySnapshot) -> Result<()>;
}

/// Errors from entity operations.
#[derive(Error, Debug)]
pub enum EntityError {
    /// `validate` rejected the candidate value.
    #[error("validation failed for {entity_type}.{field}: {reason}")]
    Validation {
        /// Entity type being validated.
        entity_type: String,
        /// The offending field, or `"<value>"` for whole-value rejections.
        field: String,
        /// Human-readable reason.
        reason: String,
    },

    /// CREATE targeted an id that already has a live or tombstoned entity.
    #[error("entity {0:?} already exists")]
    AlreadyExists(EntityKey),

    /// A delta/clock computation failed.
    #[error(transparent)]
    Delta(#[from] ledgercore_delta::DeltaError),

    /// The underlying store reported an error.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type for entity operations.
pub type Result<T> = std::result::Result<T, EntityError>;

/// The terminal outcome of one CREATE/UPDATE/DELETE apply, before the
/// interceptor's ledger-event emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyStatus {
    /// The mutation was applied; `entity` reflects the new state.
    Applied,
    /// The writer was behind current state; nothing changed.
    Stale,
    /// The writer raced a concurrent write; LWW (or the type's policy)
    /// picked a winner and `entity` reflects it, with the loser recorded
    /// under `conflicts`.
    Conflict,
}

/// The full result of applying one journal entry's operation to the store:
/// the entity's state before and after (`None` before for CREATE), and the
/// terminal status. The interceptor diffs `before`/`after` to build the
/// ledger event payload.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Entity state before the mutation, or `None` if this was a CREATE.
    pub before: Option<Entity>,
    /// Entity state after the mutation. Equal to `before` (clone) on STALE.
    /// `None` only when UPDATE/DELETE targeted an entity that does not
    /// exist at all — a STALE outcome with nothing to reflect.
    pub after: Option<Entity>,
    /// The terminal status of this apply.
    pub status: ApplyStatus,
}

/// The entity store's contract, extended with the CREATE/UPDATE/DELETE
/// apply algorithm. Implementations must serialize concurrent applies to
/// the same `(tenant, entity_type, entity_id)` so that `version` stays
/// strictly monotonic.
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch one entity by key, including soft-deleted ones.
    async fn get(&self, key: &EntityKey) -> Result<Option<Entity>>;

    /// Fetch all live (non-deleted) entities of one type for one tenant.
    async fn find(&self, tenant: &str, entity_type: &str) -> Result<Vec<Entity>>;

    /// CREATE: if `key` already has an entity (live or tombstoned), return
    /// `Stale` with the existing entity unchanged — STALE-on-CREATE does
    /// not coerce to anything else. Otherwise create at version 1.
    async fn apply_create(
        &self,
        descriptor: &dyn EntityDescriptor,
        key: EntityKey,
        payload: Value,
        vector_clock: VectorClock,
        proposed_at: OffsetDateTime,
    ) -> Result<ApplyOutcome>;

    /// UPDATE: reconcile `vector_clock` against the entity's current clock
    /// and apply, discard, or conflict-resolve.
    async fn apply_update(
        &self,
        descriptor: &dyn EntityDescriptor,
        key: &EntityKey,
        payload: Value,
        vector_clock: VectorClock,
        proposed_by: &str,
        proposed_at: OffsetDateTime,
    ) -> Result<ApplyOutcome>;

    /// DELETE: reconcile like UPDATE, but on APPLY set the soft-delete
    /// tombstone instead of merging a payload.
    async fn apply_delete(
        &self,
        descriptor: &dyn EntityDescriptor,
        key: &EntityKey,
        vector_clock: VectorClock,
        proposed_by: &str,
        proposed_at: OffsetDateTime,
    ) -> Result<ApplyOutcome>;

    /// Record the ledger position reached by the interceptor's emission for
    /// this entity. Called once per successful apply, after the ledger
    /// event has been appended.
    async fn record_ledger_position(
        &self,
        key: &EntityKey,
        ledger_sequence: u64,
        ledger_event_id: Uuid,
    ) -> Result<()>;

    /// Overwrite `value` in place and append `migration_note` to the
    /// entity's `processing_log`, bypassing the interceptor entirely: no
    /// ledger event is emitted, `version` and `vector_clock` are untouched.
    /// This is the vault sweeper's sole write path — a data-at-rest
    /// correction, not a semantic mutation.
    async fn raw_rewrite(&self, key: &EntityKey, value: Value, migration_note: String) -> Result<()>;
}

/// Shared reconcile-and-apply logic for UPDATE, used by both
/// [`memory::InMemoryEntityStore`] and [`postgres::PgEntityStore`]: given
/// the entity's current state and the incoming write, decide APPLY/STALE/
/// CONFLICT and produce the new entity value.
pub(crate) fn reconcile_update(
    descriptor: &dyn EntityDescriptor,
    mut entity: Entity,
    payload: Value,
    incoming_clock: VectorClock,
    proposed_by: &str,
    proposed_at: OffsetDateTime,
) -> Result<(Entity, ApplyStatus)> {
    let before_clock = entity.vector_clock.clone();
    match ledgercore_clock::reconcile(&before_clock, &incoming_clock) {
        ledgercore_clock::ReconcileOutcome::Apply => {
            ledgercore_delta::apply(&mut entity.value, &payload)?;
            entity.vector_clock = ledgercore_clock::merge(&before_clock, &incoming_clock);
            entity.version += 1;
            entity.last_write_at = proposed_at;
            Ok((entity, ApplyStatus::Applied))
        }
        ledgercore_clock::ReconcileOutcome::Stale => Ok((entity, ApplyStatus::Stale)),
        ledgercore_clock::ReconcileOutcome::Conflict => {
            let current_ts = entity.last_write_at.unix_timestamp();
            let policy = descriptor.conflict_policy();
            let resolution = policy.resolve(&entity.value, current_ts, &payload, proposed_at.unix_timestamp());
            entity.conflicts.push(ConflictRecord {
                device_id: proposed_by.to_string(),
                timestamp: proposed_at,
                payload: resolution.loser,
            });
            if resolution.merge_into_current {
                ledgercore_delta::apply(&mut entity.value, &resolution.winner)?;
            } else {
                entity.value = resolution.winner;
            }
            entity.vector_clock = ledgercore_clock::merge(&before_clock, &incoming_clock);
            entity.version += 1;
            entity.last_write_at = proposed_at;
            Ok((entity, ApplyStatus::Conflict))
        }
    }
}

/// Same reconcile decision as [`reconcile_update`] but for DELETE: on APPLY,
/// set the tombstone instead of merging a payload. On CONFLICT, the
/// tombstone still wins (a concurrent delete is never reversed by losing a
/// race), but — per spec §4.E step 3 — the entry is recorded under
/// `conflicts[]` and the terminal status is CONFLICT, not APPLIED, same as
/// UPDATE.
pub(crate) fn reconcile_delete(
    mut entity: Entity,
    incoming_clock: VectorClock,
    proposed_by: &str,
    proposed_at: OffsetDateTime,
) -> (Entity, ApplyStatus) {
    let before_clock = entity.vector_clock.clone();
    match ledgercore_clock::reconcile(&before_clock, &incoming_clock) {
        ledgercore_clock::ReconcileOutcome::Apply => {
            entity.deleted_at = Some(proposed_at);
            entity.vector_clock = ledgercore_clock::merge(&before_clock, &incoming_clock);
            entity.version += 1;
            entity.last_write_at = proposed_at;
            (entity, ApplyStatus::Applied)
        }
        ledgercore_clock::ReconcileOutcome::Conflict => {
            entity.conflicts.push(ConflictRecord {
                device_id: proposed_by.to_string(),
                timestamp: proposed_at,
                payload: serde_json::json!({"deletedAt": proposed_at.unix_timestamp()}),
            });
            entity.deleted_at = Some(proposed_at);
            entity.vector_clock = ledgercore_clock::merge(&before_clock, &incoming_clock);
            entity.version += 1;
            entity.last_write_at = proposed_at;
            (entity, ApplyStatus::Conflict)
        }
        ledgercore_clock::ReconcileOutcome::Stale => (entity, ApplyStatus::Stale),
    }
}

/// A simple descriptor registry mapping entity type names to descriptors,
/// used by `ledgercore-core`'s process-wide handle to look up validators
/// without hardcoding the financial domain's entity set in this crate.
#[derive(Default)]
pub struct EntityRegistry {
    descriptors: HashMap<String, Box<dyn EntityDescriptor>>,
}

impl EntityRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, keyed by its own `entity_type()`.
    pub fn register(&mut self, descriptor: Box<dyn EntityDescriptor>) {
        self.descriptors.insert(descriptor.entity_type().to_string(), descriptor);
    }

    /// Look up a descriptor by entity type name.
    pub fn get(&self, entity_type: &str) -> Option<&dyn EntityDescriptor> {
        self.descriptors.get(entity_type).map(|b| b.as_ref())
    }

    /// All registered entity type names, for callers that must sweep every
    /// type (the vault sweeper) without hardcoding the financial domain's
    /// entity set.
    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(|s| s.as_str())
    }
}
