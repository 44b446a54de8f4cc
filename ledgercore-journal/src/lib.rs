//! The pending-mutation queue: decouples acknowledgment of a write from its
//! actual application to the entity store and ledger.
//!
//! Enqueue/FIFO-drain/retry-with-limit shape behind a trait with in-memory
//! and Postgres-backed implementations, so the orchestrator can drain a
//! durable queue.
//!
//! `enqueue` never touches the entity store or ledger — it only records
//! intent. `drain` is where [`ledgercore_interceptor::Interceptor`] gets
//! called, one entry at a time, in creation order within a tenant.

#![deny(unsafe_code)]

pub mod memory;
pub mod postgres;

use ledgercore_clock::VectorClock;
use ledgercore_interceptor::{Interceptor, InterceptorError, MutationContext, Operation};
use ledgercore_ledger::{EventMetadata, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

/// Default cap on `applyEntry` retries before an entry is forced to a
/// terminal CONFLICT state with an `error_reason` (spec §4.E step 5).
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// The operation a [`JournalEntry`] proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalOperation {
    Create,
    Update,
    Delete,
}

/// A [`JournalEntry`]'s lifecycle state. Once an entry leaves `Pending` it
/// never returns — invariant 4 and testable property 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalStatus {
    Pending,
    Applied,
    Stale,
    Conflict,
}

impl JournalStatus {
    /// Whether this status is one of {APPLIED, STALE, CONFLICT} — the
    /// terminal set a [`JournalEntry`] can never leave once reached.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JournalStatus::Pending)
    }
}

/// A proposed mutation in flight (spec §3 JournalEntry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub tenant: TenantId,
    pub author: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: JournalOperation,
    /// Full value for CREATE, delta for UPDATE, empty object for DELETE.
    pub payload: Value,
    pub vector_clock: VectorClock,
    pub status: JournalStatus,
    pub retry_count: u32,
    pub error_reason: Option<String>,
    pub metadata: EventMetadata,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Errors from journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal entry {0} not found")]
    NotFound(Uuid),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, JournalError>;

/// The journal's public contract (spec §4.E).
///
/// `enqueue` never blocks on entity state and always succeeds with a
/// PENDING entry. `drain` is invoked by the orchestrator on a schedule; it
/// scans the oldest PENDING entries FIFO-by-tenant and applies each through
/// an [`Interceptor`].
#[async_trait::async_trait]
pub trait Journal: Send + Sync {
    /// Record a proposed mutation and return it immediately with status
    /// PENDING.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<JournalEntry>;

    /// Drain at most `batch_size` oldest PENDING entries through
    /// `interceptor`, returning the entries touched (terminal or still
    /// PENDING after a retryable failure).
    async fn drain(&self, interceptor: &Interceptor, batch_size: usize) -> Result<Vec<JournalEntry>>;

    /// Fetch one entry by id, for status polling.
    async fn get(&self, id: Uuid) -> Result<Option<JournalEntry>>;
}

fn to_operation(entry: &JournalEntry) -> Operation {
    match entry.operation {
        JournalOperation::Create => Operation::Create { payload: entry.payload.clone() },
        JournalOperation::Update => Operation::Update { payload: entry.payload.clone() },
        JournalOperation::Delete => Operation::Delete,
    }
}

/// Shared `applyEntry` transition (spec §4.E steps 1-5), used by both
/// [`memory::InMemoryJournal`] and [`postgres::PgJournal`]. Mutates `entry`
/// in place to reflect the outcome; never leaves a non-PENDING entry or
/// silently swallows an interceptor error.
pub(crate) async fn apply_entry(interceptor: &Interceptor, entry: &mut JournalEntry, max_retries: u32) {
    let ctx = MutationContext {
        tenant: entry.tenant.clone(),
        entity_type: entry.entity_type.clone(),
        entity_id: entry.entity_id.clone(),
        actor: entry.author.clone(),
        vector_clock: entry.vector_clock.clone(),
        proposed_at: OffsetDateTime::now_utc(),
        metadata: entry.metadata.clone(),
    };
    let operation = to_operation(entry);

    match interceptor.apply(ctx, operation).await {
        Ok(result) => {
            entry.status = match result.status {
                ledgercore_entity::ApplyStatus::Applied => JournalStatus::Applied,
                ledgercore_entity::ApplyStatus::Stale => JournalStatus::Stale,
                ledgercore_entity::ApplyStatus::Conflict => JournalStatus::Conflict,
            };
            if let Some(entity) = &result.entity {
                entry.vector_clock = entity.vector_clock.clone();
            }
            entry.updated_at = OffsetDateTime::now_utc();
        }
        Err(err) => {
            entry.retry_count += 1;
            entry.updated_at = OffsetDateTime::now_utc();
            if entry.retry_count >= max_retries {
                warn!(entry_id = %entry.id, retries = entry.retry_count, "journal entry exhausted retries, forcing CONFLICT");
                entry.status = JournalStatus::Conflict;
                entry.error_reason = Some(format_error(&err));
            }
        }
    }
}

fn format_error(err: &InterceptorError) -> String {
    format!("{err}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_never_include_pending() {
        assert!(!JournalStatus::Pending.is_terminal());
        assert!(JournalStatus::Applied.is_terminal());
        assert!(JournalStatus::Stale.is_terminal());
        assert!(JournalStatus::Conflict.is_terminal());
    }
}
