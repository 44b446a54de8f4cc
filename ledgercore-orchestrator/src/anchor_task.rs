//! Merkle anchor schedule: daily 02:00 local by default.

use crate::{Result, TenantDirectory};
use crate::ScheduledTask;
use ledgercore_anchor::AnchorStore;
use ledgercore_ledger::Ledger;
use std::sync::Arc;
use tracing::info;

/// Runs one anchor cycle per active tenant.
pub struct AnchorTask {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn AnchorStore>,
    tenants: Arc<dyn TenantDirectory>,
}

impl AnchorTask {
    pub fn new(ledger: Arc<dyn Ledger>, store: Arc<dyn AnchorStore>, tenants: Arc<dyn TenantDirectory>) -> Self {
        Self { ledger, store, tenants }
    }
}

#[async_trait::async_trait]
impl ScheduledTask for AnchorTask {
    fn name(&self) -> &str {
        "merkle-anchor"
    }

    async fn run_once(&self) -> Result<()> {
        for tenant in self.tenants.active_tenants().await {
            if let Some(anchor) = ledgercore_anchor::run_for_tenant(self.ledger.as_ref(), self.store.as_ref(), &tenant).await? {
                info!(tenant = %tenant, start = anchor.start_sequence, end = anchor.end_sequence, "anchored ledger range");
            }
        }
        Ok(())
    }
}
