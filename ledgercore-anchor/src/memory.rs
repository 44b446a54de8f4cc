//! In-process anchor store for tests: one `Vec<MerkleAnchor>` per tenant,
//! ordered by append (which is always `start_sequence` ascending).

use crate::{AnchorStore, MerkleAnchor, Result};
use ledgercore_ledger::TenantId;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// An in-memory [`AnchorStore`].
#[derive(Default)]
pub struct InMemoryAnchorStore {
    anchors: Mutex<HashMap<TenantId, Vec<MerkleAnchor>>>,
}

impl InMemoryAnchorStore {
    /// A fresh, empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AnchorStore for InMemoryAnchorStore {
    async fn last_anchor(&self, tenant: &TenantId) -> Result<Option<MerkleAnchor>> {
        Ok(self.anchors.lock().await.get(tenant).and_then(|v| v.last().cloned()))
    }

    async fn append(&self, anchor: MerkleAnchor) -> Result<MerkleAnchor> {
        let mut map = self.anchors.lock().await;
        map.entry(anchor.tenant.clone()).or_default().push(anchor.clone());
        Ok(anchor)
    }

    async fn history(&self, tenant: &TenantId) -> Result<Vec<MerkleAnchor>> {
        Ok(self.anchors.lock().await.get(tenant).cloned().unwrap_or_default())
    }
}
