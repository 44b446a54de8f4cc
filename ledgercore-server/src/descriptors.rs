//! Concrete entity types for a financial tracker (spec §3 Entity: "a
//! managed domain object (financial transaction, budget, policy, etc.)";
//! spec §2 component F names `Transaction, Workspace` as the representative
//! pair). These are the only descriptors the binary registers; adding a new
//! entity type to the running system means writing one more of these and
//! registering it in [`registry`].

use ledgercore_entity::{EntityDescriptor, EntityError, Result};
use serde_json::Value;

/// A single recorded money movement. `accountNumber` is vaulted at rest
/// (spec §4.I field-level encryption) since it is the one field here that
/// identifies a real-world payment instrument.
pub struct TransactionDescriptor;

impl EntityDescriptor for TransactionDescriptor {
    fn entity_type(&self) -> &'static str {
        "transaction"
    }

    fn sensitive_keys(&self) -> &'static [&'static str] {
        &["accountNumber"]
    }

    fn validate(&self, value: &Value) -> Result<()> {
        if value.get("amount").and_then(Value::as_f64).is_none() {
            return Err(EntityError::Validation {
                entity_type: "transaction".to_string(),
                field: "amount".to_string(),
                reason: "must be a number".to_string(),
            });
        }
        if !value.get("category").map(Value::is_string).unwrap_or(false) {
            return Err(EntityError::Validation {
                entity_type: "transaction".to_string(),
                field: "category".to_string(),
                reason: "must be a string".to_string(),
            });
        }
        Ok(())
    }
}

/// A grouping of transactions under one owner (spec §2 component F's other
/// named example, "Workspace"). Long-lived relative to a transaction, so
/// replay snapshots every 50 versions rather than folding from genesis.
pub struct WorkspaceDescriptor;

impl EntityDescriptor for WorkspaceDescriptor {
    fn entity_type(&self) -> &'static str {
        "workspace"
    }

    fn validate(&self, value: &Value) -> Result<()> {
        if !value.get("name").map(Value::is_string).unwrap_or(false) {
            return Err(EntityError::Validation {
                entity_type: "workspace".to_string(),
                field: "name".to_string(),
                reason: "must be a string".to_string(),
            });
        }
        Ok(())
    }

    fn snapshot_every(&self) -> Option<u64> {
        Some(50)
    }
}

/// A budget cap for one category, enforced by collaborators outside the
/// core (spec §1 Non-goals: "not a general KV store" but domain-shaped
/// entities beyond Transaction still pass through the same apply path).
pub struct BudgetDescriptor;

impl EntityDescriptor for BudgetDescriptor {
    fn entity_type(&self) -> &'static str {
        "budget"
    }

    fn validate(&self, value: &Value) -> Result<()> {
        if !value.get("category").map(Value::is_string).unwrap_or(false) {
            return Err(EntityError::Validation {
                entity_type: "budget".to_string(),
                field: "category".to_string(),
                reason: "must be a string".to_string(),
            });
        }
        if value.get("limit").and_then(Value::as_f64).is_none() {
            return Err(EntityError::Validation {
                entity_type: "budget".to_string(),
                field: "limit".to_string(),
                reason: "must be a number".to_string(),
            });
        }
        Ok(())
    }
}

/// All entity types the running system knows about.
pub fn register(registry: &mut ledgercore_entity::EntityRegistry) {
    registry.register(Box::new(TransactionDescriptor));
    registry.register(Box::new(WorkspaceDescriptor));
    registry.register(Box::new(BudgetDescriptor));
}
