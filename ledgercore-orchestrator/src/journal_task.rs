//! Journal drain schedule: every 30s by default.

use crate::{Result, ScheduledTask};
use ledgercore_interceptor::Interceptor;
use ledgercore_journal::Journal;
use std::sync::Arc;
use tracing::debug;

/// Drains up to `batch_size` pending journal entries per tick.
pub struct JournalDrainTask {
    journal: Arc<dyn Journal>,
    interceptor: Arc<Interceptor>,
    batch_size: usize,
}

impl JournalDrainTask {
    pub fn new(journal: Arc<dyn Journal>, interceptor: Arc<Interceptor>, batch_size: usize) -> Self {
        Self { journal, interceptor, batch_size }
    }
}

#[async_trait::async_trait]
impl ScheduledTask for JournalDrainTask {
    fn name(&self) -> &str {
        "journal-drain"
    }

    async fn run_once(&self) -> Result<()> {
        let drained = self.journal.drain(&self.interceptor, self.batch_size).await?;
        if !drained.is_empty() {
            debug!(count = drained.len(), "drained journal entries");
        }
        Ok(())
    }
}
