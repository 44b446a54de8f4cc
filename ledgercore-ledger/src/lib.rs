//! The per-tenant, append-only, hash-chained event ledger (spec component
//! 4.D). This is the system's tamper-evident memory: once an event is
//! appended it is never mutated, and every event beyond the first carries
//! the previous event's hash, making the sequence self-verifying.
//!
//! Two implementations are provided: [`memory::InMemoryLedger`] for tests
//! and single-process experimentation, and [`postgres::PgLedger`] for
//! production, which serializes appends per tenant with a `SELECT ... FOR
//! UPDATE` row lock the way `ubl-server`'s database layer does.

#![deny(unsafe_code)]

pub mod memory;
pub mod postgres;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Tenant identifier. A thin newtype over the source system's bare
/// `container_id` string — the financial domain has no notion of a
/// "container", so we give tenancy its own type at this boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        TenantId(s.to_string())
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        TenantId(s)
    }
}

/// A reference to the entity a ledger event concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity type name (e.g. `"transaction"`, `"budget"`).
    pub entity_type: String,
    /// Entity identifier, unique within its type and tenant.
    pub entity_id: String,
}

/// The kind of mutation a ledger event records. `Custom` covers
/// domain-specific event types (`FUNDS_RESERVED`, `TAX_DEDUCTION_ESTIMATED`,
/// ...) without requiring this crate to know the full domain vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEventType {
    /// Entity was created.
    Created,
    /// Entity was updated.
    Updated,
    /// Entity was soft-deleted.
    Deleted,
    /// A domain-specific event type outside the CRUD trio.
    #[serde(untagged)]
    Custom(String),
}

impl fmt::Display for LedgerEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerEventType::Created => write!(f, "CREATED"),
            LedgerEventType::Updated => write!(f, "UPDATED"),
            LedgerEventType::Deleted => write!(f, "DELETED"),
            LedgerEventType::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Out-of-band context for an event: device, correlation id for tracing a
/// request across components, and optionally IP/user-agent for forensic
/// review.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Device identifier the write originated from, if known.
    pub device_id: Option<String>,
    /// Correlation id linking this event to the request that caused it.
    pub correlation_id: Option<String>,
    /// Originating IP address, if retained.
    pub ip: Option<String>,
    /// User-agent string, if retained.
    pub user_agent: Option<String>,
}

/// An immutable entry in a tenant's ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Event identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Per-tenant strictly increasing sequence number, starting at 1.
    pub sequence: u64,
    /// The kind of mutation this event records.
    pub event_type: LedgerEventType,
    /// The entity this event concerns.
    pub entity: EntityRef,
    /// Full snapshot (CREATE) or delta (UPDATE) or tombstone (DELETE).
    pub payload: serde_json::Value,
    /// Author principal id.
    pub author: String,
    /// The previous event's id, or `None` for the first event in the chain.
    pub previous_event_id: Option<Uuid>,
    /// The previous event's `current_hash`, or [`ledgercore_hash::GENESIS_SENTINEL`].
    pub previous_hash: String,
    /// `H_event(payload, previous_hash, sequence)`.
    pub current_hash: String,
    /// Out-of-band context.
    pub metadata: EventMetadata,
    /// Creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// The result of [`Ledger::verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    /// Whether the chain is internally consistent over the checked range.
    pub valid: bool,
    /// The first sequence number at which the chain broke, if any.
    pub first_corruption: Option<u64>,
}

/// Errors from ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The tenant's ledger is quarantined after a detected chain break;
    /// appends are refused until a human-triggered repair (spec §4.D
    /// Failure, §6 `ledger.quarantineOnCorruption`).
    #[error("ledger for tenant {0} is quarantined pending repair")]
    Quarantined(TenantId),

    /// Hashing the event failed.
    #[error("failed to hash event: {0}")]
    Hash(#[from] ledgercore_hash::HashError),

    /// The requested sequence range was invalid (e.g. start > end).
    #[error("invalid sequence range: {start}..={end}")]
    InvalidRange {
        /// requested start
        start: u64,
        /// requested end
        end: u64,
    },

    /// The underlying store reported an error.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// The ledger's public contract (spec §4.D).
///
/// Implementations must serialize `append` per tenant so that invariants
/// 1–2 (gap-free sequencing, unbroken hash chain) hold under concurrent
/// writers; there is no cross-tenant ordering guarantee.
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    /// Atomically append a new event for `tenant`, computing `sequence`,
    /// `previous_hash`, and `current_hash` from the tenant's current chain
    /// head.
    async fn append(
        &self,
        tenant: &TenantId,
        entity: EntityRef,
        event_type: LedgerEventType,
        payload: serde_json::Value,
        author: &str,
        metadata: EventMetadata,
    ) -> Result<LedgerEvent>;

    /// The last event appended for `tenant`, if any.
    async fn find_last(&self, tenant: &TenantId) -> Result<Option<LedgerEvent>>;

    /// Events in `[start_seq, end_seq]` inclusive, ordered by sequence.
    async fn range(&self, tenant: &TenantId, start_seq: u64, end_seq: u64) -> Result<Vec<LedgerEvent>>;

    /// All events referencing `entity_id`, ordered by sequence.
    async fn history_for(&self, tenant: &TenantId, entity_id: &str) -> Result<Vec<LedgerEvent>>;

    /// A single event by id, for proof requests that start from an event id
    /// rather than a sequence (spec §6 Proof request).
    async fn find_by_id(&self, tenant: &TenantId, event_id: Uuid) -> Result<Option<LedgerEvent>>;

    /// Recompute the hash chain over `[start_seq, end_seq]` (defaulting to
    /// the tenant's full range when `None`) and compare against what is
    /// stored.
    async fn verify_chain(
        &self,
        tenant: &TenantId,
        start_seq: Option<u64>,
        end_seq: Option<u64>,
    ) -> Result<ChainVerification>;

    /// Whether `tenant`'s ledger is currently quarantined.
    async fn is_quarantined(&self, tenant: &TenantId) -> Result<bool>;

    /// Quarantine `tenant`'s ledger, refusing further appends until
    /// [`Ledger::repair`] is called. Invoked when `verify_chain` or an
    /// append-time consistency check detects a broken chain and
    /// `ledger.quarantineOnCorruption` is enabled (spec §6).
    async fn quarantine(&self, tenant: &TenantId) -> Result<()>;

    /// Lift a quarantine after a human-triggered repair. Implementations
    /// do not attempt to repair the chain themselves — that is an
    /// operator action outside this crate's scope.
    async fn repair(&self, tenant: &TenantId) -> Result<()>;
}

/// Shared verification logic used by both [`memory::InMemoryLedger`] and
/// [`postgres::PgLedger`]: given an ordered, contiguous slice of events,
/// recompute the chain and report the first break.
pub(crate) fn verify_events(events: &[LedgerEvent]) -> Result<ChainVerification> {
    let mut previous_hash = events
        .first()
        .map(|e| {
            if e.sequence == 1 {
                ledgercore_hash::GENESIS_SENTINEL.to_string()
            } else {
                e.previous_hash.clone()
            }
        })
        .unwrap_or_else(|| ledgercore_hash::GENESIS_SENTINEL.to_string());

    for event in events {
        if event.previous_hash != previous_hash {
            return Ok(ChainVerification {
                valid: false,
                first_corruption: Some(event.sequence),
            });
        }
        let recomputed = ledgercore_hash::h_event(&event.payload, &event.previous_hash, event.sequence)?;
        if recomputed != event.current_hash {
            return Ok(ChainVerification {
                valid: false,
                first_corruption: Some(event.sequence),
            });
        }
        previous_hash = event.current_hash.clone();
    }

    Ok(ChainVerification {
        valid: true,
        first_corruption: None,
    })
}
