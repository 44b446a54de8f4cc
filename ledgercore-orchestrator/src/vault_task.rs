//! Vault sweep schedule: daily off-peak by default.
//!
//! Scans every registered entity type for sensitive fields still in the
//! clear and vaults them in place, bypassing the interceptor entirely —
//! these are data-at-rest corrections, not semantic mutations, so no
//! [`ledgercore_ledger::LedgerEvent`] is ever emitted for them.

use crate::{Result, ScheduledTask, TenantDirectory};
use ledgercore_entity::{EntityKey, EntityRegistry, EntityStore};
use ledgercore_vault::Vault;
use serde_json::Value;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::info;

pub struct VaultSweepTask {
    entities: Arc<dyn EntityStore>,
    registry: Arc<EntityRegistry>,
    vault: Arc<Vault>,
    tenants: Arc<dyn TenantDirectory>,
}

impl VaultSweepTask {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        registry: Arc<EntityRegistry>,
        vault: Arc<Vault>,
        tenants: Arc<dyn TenantDirectory>,
    ) -> Self {
        Self { entities, registry, vault, tenants }
    }
}

#[async_trait::async_trait]
impl ScheduledTask for VaultSweepTask {
    fn name(&self) -> &str {
        "vault-sweep"
    }

    async fn run_once(&self) -> Result<()> {
        let mut rewritten = 0usize;
        for tenant in self.tenants.active_tenants().await {
            for entity_type in self.registry.entity_types() {
                let descriptor = match self.registry.get(entity_type) {
                    Some(d) => d,
                    None => continue,
                };
                let sensitive_keys = descriptor.sensitive_keys();
                if sensitive_keys.is_empty() {
                    continue;
                }

                let candidates = self.entities.find(&tenant.0, entity_type).await?;
                for entity in candidates {
                    if let Some(rewrite) = self.vault_unvaulted_fields(&tenant.0, sensitive_keys, entity.value.clone()).await? {
                        let key = EntityKey { tenant: tenant.0.clone(), entity_type: entity_type.to_string(), entity_id: entity.key.entity_id.clone() };
                        let note = format!("MIGRATION vault-sweep {}", OffsetDateTime::now_utc());
                        self.entities.raw_rewrite(&key, rewrite, note).await?;
                        rewritten += 1;
                    }
                }
            }
        }
        if rewritten > 0 {
            info!(count = rewritten, "vault sweep rewrote entities with unvaulted sensitive fields");
        }
        Ok(())
    }
}

impl VaultSweepTask {
    /// Returns the rewritten value if any sensitive field needed vaulting,
    /// or `None` if the entity was already fully vaulted.
    async fn vault_unvaulted_fields(&self, tenant: &str, sensitive_keys: &[&str], mut value: Value) -> Result<Option<Value>> {
        let mut changed = false;
        if let Some(obj) = value.as_object_mut() {
            for key in sensitive_keys {
                if let Some(v) = obj.get(*key) {
                    if let Some(s) = v.as_str() {
                        if !Vault::is_ciphertext(s) {
                            let marker = self.vault.encrypt(tenant, s.as_bytes()).await?;
                            obj.insert((*key).to_string(), Value::String(marker));
                            changed = true;
                        }
                    }
                }
            }
        }
        Ok(if changed { Some(value) } else { None })
    }
}
