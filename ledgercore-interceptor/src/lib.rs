//! The mutation interceptor: the only code path allowed to call
//! [`ledgercore_ledger::Ledger::append`]. Every CREATE, UPDATE, and DELETE
//! flows through here so that "entity changed" and "ledger event recorded"
//! are always true together.
//!
//! Order of operations per mutation:
//!
//! 1. Look up the entity type's descriptor in the [`EntityRegistry`].
//! 2. Vault-encrypt the descriptor's `sensitive_keys` in the incoming
//!    payload, so the entity store never sees sensitive values in the
//!    clear.
//! 3. Delegate to the [`EntityStore`] to load, reconcile, and persist.
//! 4. Diff before/after into a ledger payload and append it, then record
//!    the resulting ledger position back onto the entity.
//!
//! `ledgercore-entity` does not depend on `ledgercore-ledger` or
//! `ledgercore-vault` — it has no idea either exists. This crate is the one
//! place that wires all three together, which is also why it is the one
//! place callers reach for mutations instead of calling the entity store
//! directly.

#![deny(unsafe_code)]

use ledgercore_clock::VectorClock;
use ledgercore_entity::{ApplyStatus, EntityError, EntityKey, EntityRegistry, EntityStore};
use ledgercore_ledger::{EntityRef, EventMetadata, Ledger, LedgerError, LedgerEventType, TenantId};
use ledgercore_vault::{Vault, VaultError};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::instrument;

/// Errors from one intercepted mutation.
#[derive(Debug, Error)]
pub enum InterceptorError {
    #[error("unknown entity type {0:?}")]
    UnknownEntityType(String),

    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Delta(#[from] ledgercore_delta::DeltaError),
}

pub type Result<T> = std::result::Result<T, InterceptorError>;

/// A mutation request, as it arrives from the journal.
#[derive(Debug, Clone)]
pub enum Operation {
    Create { payload: Value },
    Update { payload: Value },
    Delete,
}

/// Everything the interceptor needs to know about who is asking and why,
/// beyond the mutation itself — carried through to the ledger event's
/// metadata and author field.
#[derive(Debug, Clone)]
pub struct MutationContext {
    pub tenant: TenantId,
    pub entity_type: String,
    pub entity_id: String,
    pub actor: String,
    pub vector_clock: VectorClock,
    pub proposed_at: OffsetDateTime,
    pub metadata: EventMetadata,
}

/// The outcome of one intercepted mutation: the entity's terminal state and,
/// unless the mutation was a no-op STALE, the ledger event recorded for it.
#[derive(Debug, Clone)]
pub struct InterceptResult {
    pub status: ApplyStatus,
    /// `None` only when an UPDATE/DELETE targeted an entity that does not
    /// exist at all — a STALE outcome with nothing to reflect.
    pub entity: Option<ledgercore_entity::Entity>,
    pub ledger_event: Option<ledgercore_ledger::LedgerEvent>,
}

/// Wraps an [`EntityStore`], a [`Ledger`], a [`Vault`], and an
/// [`EntityRegistry`] into the single path mutations travel.
pub struct Interceptor {
    entities: Arc<dyn EntityStore>,
    ledger: Arc<dyn Ledger>,
    vault: Arc<Vault>,
    registry: Arc<EntityRegistry>,
}

impl Interceptor {
    /// The ledger this interceptor appends to, for callers (tests, forensic
    /// tooling) that need to inspect the chain directly rather than through
    /// an entity's `last_ledger_event_id`.
    pub fn ledger_for_test(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// The entity store this interceptor mutates, for the same direct-
    /// inspection callers as [`Interceptor::ledger_for_test`].
    pub fn entities_for_test(&self) -> &Arc<dyn EntityStore> {
        &self.entities
    }

    pub fn new(
        entities: Arc<dyn EntityStore>,
        ledger: Arc<dyn Ledger>,
        vault: Arc<Vault>,
        registry: Arc<EntityRegistry>,
    ) -> Self {
        Self { entities, ledger, vault, registry }
    }

    /// Apply one mutation end to end: validate, reconcile, persist, vault
    /// sensitive fields, emit the ledger event, and record its position.
    #[instrument(skip(self, operation), fields(tenant = %ctx.tenant, entity_type = %ctx.entity_type, entity_id = %ctx.entity_id))]
    pub async fn apply(&self, ctx: MutationContext, operation: Operation) -> Result<InterceptResult> {
        let descriptor = self
            .registry
            .get(&ctx.entity_type)
            .ok_or_else(|| InterceptorError::UnknownEntityType(ctx.entity_type.clone()))?;

        let key = EntityKey {
            tenant: ctx.tenant.0.clone(),
            entity_type: ctx.entity_type.clone(),
            entity_id: ctx.entity_id.clone(),
        };

        let outcome = match &operation {
            Operation::Create { payload } => {
                let vaulted = self.vault_sensitive_fields(&ctx.tenant.0, descriptor.sensitive_keys(), payload.clone()).await?;
                self.entities
                    .apply_create(descriptor, key.clone(), vaulted, ctx.vector_clock.clone(), ctx.proposed_at)
                    .await?
            }
            Operation::Update { payload } => {
                let vaulted = self.vault_sensitive_fields(&ctx.tenant.0, descriptor.sensitive_keys(), payload.clone()).await?;
                self.entities
                    .apply_update(descriptor, &key, vaulted, ctx.vector_clock.clone(), &ctx.actor, ctx.proposed_at)
                    .await?
            }
            Operation::Delete => {
                self.entities
                    .apply_delete(descriptor, &key, ctx.vector_clock.clone(), &ctx.actor, ctx.proposed_at)
                    .await?
            }
        };

        if outcome.status == ApplyStatus::Stale {
            return Ok(InterceptResult { status: outcome.status, entity: outcome.after, ledger_event: None });
        }

        let entity = outcome.after.clone().expect("non-stale apply outcome always carries an entity");
        let (event_type, ledger_payload) = self.build_ledger_payload(&operation, &outcome.before, &entity)?;
        let event = self
            .ledger
            .append(
                &ctx.tenant,
                EntityRef { entity_type: ctx.entity_type.clone(), entity_id: ctx.entity_id.clone() },
                event_type,
                ledger_payload,
                &ctx.actor,
                ctx.metadata,
            )
            .await?;

        self.entities.record_ledger_position(&key, event.sequence, event.id).await?;

        Ok(InterceptResult { status: outcome.status, entity: Some(entity), ledger_event: Some(event) })
    }

    /// Encrypt the descriptor's sensitive top-level keys in `payload`,
    /// leaving everything else untouched. A value already shaped like a
    /// vault marker is left alone rather than double-encrypted, so replaying
    /// an UPDATE whose payload only touches non-sensitive fields does not
    /// re-wrap an unrelated sensitive field.
    async fn vault_sensitive_fields(&self, tenant: &str, sensitive_keys: &[&str], mut payload: Value) -> Result<Value> {
        if sensitive_keys.is_empty() {
            return Ok(payload);
        }
        if let Some(obj) = payload.as_object_mut() {
            for key in sensitive_keys {
                if let Some(value) = obj.get(*key) {
                    if let Some(s) = value.as_str() {
                        if !Vault::is_ciphertext(s) {
                            let marker = self.vault.encrypt(tenant, s.as_bytes()).await?;
                            obj.insert((*key).to_string(), Value::String(marker));
                        }
                    }
                }
            }
        }
        Ok(payload)
    }

    /// Build the ledger event's type and payload from the apply outcome.
    /// CREATE carries the full snapshot; UPDATE carries a delta against the
    /// prior value; DELETE carries the tombstone marker. CONFLICT carries
    /// the winning delta, same as a normal UPDATE — the losing write is
    /// recoverable from the entity's `conflicts` list, not the ledger.
    fn build_ledger_payload(
        &self,
        operation: &Operation,
        before: &Option<ledgercore_entity::Entity>,
        after: &ledgercore_entity::Entity,
    ) -> Result<(LedgerEventType, Value)> {
        match operation {
            Operation::Create { .. } => Ok((LedgerEventType::Created, after.value.clone())),
            Operation::Update { .. } => {
                let before = before.as_ref().map(|e| &e.value).cloned().unwrap_or(Value::Object(Default::default()));
                let diff = ledgercore_delta::delta(&before, &after.value)?;
                let diff_value = serde_json::to_value(&diff).unwrap_or(Value::Object(Default::default()));
                Ok((LedgerEventType::Updated, serde_json::json!({ "_isDelta": true, "diff": diff_value })))
            }
            Operation::Delete => Ok((LedgerEventType::Deleted, serde_json::json!({ "deletedAt": after.deleted_at }))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgercore_entity::{memory::InMemoryEntityStore, EntityDescriptor};
    use ledgercore_ledger::memory::InMemoryLedger;
    use serde_json::json;

    struct TxDescriptor;
    impl EntityDescriptor for TxDescriptor {
        fn entity_type(&self) -> &'static str {
            "transaction"
        }
        fn sensitive_keys(&self) -> &'static [&'static str] {
            &["note"]
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

    fn make_interceptor() -> Interceptor {
        let mut registry = EntityRegistry::new();
        registry.register(Box::new(TxDescriptor));
        Interceptor::new(
            Arc::new(InMemoryEntityStore::new()),
            Arc::new(InMemoryLedger::new()),
            Arc::new(Vault::new(b"test-secret".to_vec())),
            Arc::new(registry),
        )
    }

    fn ctx(entity_id: &str, actor: &str, clock: u64) -> MutationContext {
        MutationContext {
            tenant: TenantId("t1".to_string()),
            entity_type: "transaction".to_string(),
            entity_id: entity_id.to_string(),
            actor: actor.to_string(),
            vector_clock: [(actor.to_string(), clock)].into_iter().collect(),
            proposed_at: OffsetDateTime::now_utc(),
            metadata: EventMetadata::default(),
        }
    }

    #[tokio::test]
    async fn create_emits_snapshot_event() {
        let ic = make_interceptor();
        let result = ic
            .apply(ctx("tx1", "alice:dev1", 1), Operation::Create { payload: json!({"amount": 100}) })
            .await
            .unwrap();
        assert_eq!(result.status, ApplyStatus::Applied);
        let event = result.ledger_event.unwrap();
        assert_eq!(event.event_type, LedgerEventType::Created);
        assert_eq!(event.payload["amount"], json!(100));
        assert_eq!(event.sequence, 1);
    }

    #[tokio::test]
    async fn update_emits_delta_event() {
        let ic = make_interceptor();
        ic.apply(ctx("tx1", "alice:dev1", 1), Operation::Create { payload: json!({"amount": 100, "category": "food"}) })
            .await
            .unwrap();

        let result = ic
            .apply(ctx("tx1", "alice:dev1", 2), Operation::Update { payload: json!({"amount": 150}) })
            .await
            .unwrap();
        let event = result.ledger_event.unwrap();
        assert_eq!(event.event_type, LedgerEventType::Updated);
        assert_eq!(event.payload["_isDelta"], json!(true));
        assert_eq!(event.sequence, 2);
    }

    #[tokio::test]
    async fn sensitive_field_is_vaulted_before_persistence() {
        let ic = make_interceptor();
        ic.apply(
            ctx("tx1", "alice:dev1", 1),
            Operation::Create { payload: json!({"amount": 100, "note": "loan repayment"}) },
        )
        .await
        .unwrap();

        let entity = ic.entities.get(&EntityKey { tenant: "t1".into(), entity_type: "transaction".into(), entity_id: "tx1".into() })
            .await
            .unwrap()
            .unwrap();
        let note = entity.value["note"].as_str().unwrap();
        assert!(Vault::is_ciphertext(note));
    }

    #[tokio::test]
    async fn stale_write_emits_no_ledger_event() {
        let ic = make_interceptor();
        ic.apply(ctx("tx1", "alice:dev1", 2), Operation::Create { payload: json!({"amount": 100}) }).await.unwrap();

        let result = ic
            .apply(ctx("tx1", "alice:dev1", 1), Operation::Update { payload: json!({"amount": 999}) })
            .await
            .unwrap();
        assert_eq!(result.status, ApplyStatus::Stale);
        assert!(result.ledger_event.is_none());
    }

    #[tokio::test]
    async fn update_against_missing_entity_is_stale_not_an_error() {
        let ic = make_interceptor();
        let result = ic
            .apply(ctx("ghost", "alice:dev1", 1), Operation::Update { payload: json!({"amount": 999}) })
            .await
            .unwrap();
        assert_eq!(result.status, ApplyStatus::Stale);
        assert!(result.entity.is_none());
        assert!(result.ledger_event.is_none());
    }

    #[tokio::test]
    async fn delete_against_missing_entity_is_stale_not_an_error() {
        let ic = make_interceptor();
        let result = ic.apply(ctx("ghost", "alice:dev1", 1), Operation::Delete).await.unwrap();
        assert_eq!(result.status, ApplyStatus::Stale);
        assert!(result.entity.is_none());
        assert!(result.ledger_event.is_none());
    }

    #[tokio::test]
    async fn unknown_entity_type_is_rejected() {
        let ic = make_interceptor();
        let mut bad_ctx = ctx("tx1", "alice:dev1", 1);
        bad_ctx.entity_type = "budget".to_string();
        let err = ic.apply(bad_ctx, Operation::Create { payload: json!({}) }).await.unwrap_err();
        assert!(matches!(err, InterceptorError::UnknownEntityType(_)));
    }
}
