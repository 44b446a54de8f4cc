//! Background task scheduling: journal drain, Merkle anchoring, and the
//! vault sweep, each on its own interval.
//!
//! A small registry of named [`ScheduledTask`]s the [`Orchestrator`] ticks
//! independently. Each task gets the same guarantees: a singleton
//! running-guard so a slow iteration cannot overlap itself, per-iteration
//! error isolation so one bad tick doesn't starve the next, and a deadline
//! derived from the tick interval.

#![deny(unsafe_code)]

mod anchor_task;
mod journal_task;
mod vault_task;

pub use anchor_task::AnchorTask;
pub use journal_task::JournalDrainTask;
pub use vault_task::VaultSweepTask;

use ledgercore_ledger::TenantId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Errors a [`ScheduledTask`] iteration can report. The orchestrator logs
/// and discards these — a failing iteration never stops the schedule.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Journal(#[from] ledgercore_journal::JournalError),

    #[error(transparent)]
    Interceptor(#[from] ledgercore_interceptor::InterceptorError),

    #[error(transparent)]
    Anchor(#[from] ledgercore_anchor::AnchorError),

    #[error(transparent)]
    Entity(#[from] ledgercore_entity::EntityError),

    #[error(transparent)]
    Vault(#[from] ledgercore_vault::VaultError),
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// Enumerates the tenants a per-tenant task (anchor, vault sweep) must
/// visit each iteration. Lives here rather than in `ledgercore-entity` or
/// `ledgercore-ledger` because those crates are tenant-agnostic by design —
/// `ledgercore-core`'s tenant store is the one concrete implementation.
#[async_trait::async_trait]
pub trait TenantDirectory: Send + Sync {
    /// All tenants currently active (not suspended/archived).
    async fn active_tenants(&self) -> Vec<TenantId>;
}

/// One schedulable unit of background work.
#[async_trait::async_trait]
pub trait ScheduledTask: Send + Sync {
    /// A short name for logging (e.g. `"journal-drain"`).
    fn name(&self) -> &str;

    /// Run one iteration. Errors are caught by the orchestrator and logged;
    /// they must not panic or leave shared state inconsistent.
    async fn run_once(&self) -> Result<()>;
}

/// A task plus the interval the orchestrator ticks it on.
pub struct Schedule {
    pub task: Arc<dyn ScheduledTask>,
    pub interval: Duration,
}

impl Schedule {
    pub fn new(task: Arc<dyn ScheduledTask>, interval: Duration) -> Self {
        Self { task, interval }
    }
}

struct Running {
    name: String,
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

/// Owns and runs the full set of scheduled background tasks. `start`
/// spawns one tokio task per [`Schedule`]; `shutdown` signals all of them
/// to stop accepting new iterations and waits up to a timeout for
/// in-flight ones to finish.
#[derive(Default)]
pub struct Orchestrator {
    running: Vec<Running>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start every schedule. Each task gets its own singleton running-guard
    /// so a slow iteration is skipped over, not queued, on the next tick.
    pub fn start(&mut self, schedules: Vec<Schedule>) {
        for schedule in schedules {
            let name = schedule.task.name().to_string();
            let shutdown = Arc::new(Notify::new());
            let shutdown_rx = shutdown.clone();
            let task = schedule.task.clone();
            let interval_duration = schedule.interval;
            let in_flight = Arc::new(AtomicBool::new(false));

            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval_duration);
                // Safety margin so a cancelled iteration's deadline never
                // exceeds the next tick.
                let deadline = interval_duration.mul_f32(0.9);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if in_flight.swap(true, Ordering::SeqCst) {
                                warn!(task = %task.name(), "previous iteration still running, skipping tick");
                                continue;
                            }
                            let result = tokio::time::timeout(deadline, task.run_once()).await;
                            in_flight.store(false, Ordering::SeqCst);
                            match result {
                                Ok(Ok(())) => {}
                                Ok(Err(err)) => error!(task = %task.name(), error = %err, "scheduled task iteration failed"),
                                Err(_) => warn!(task = %task.name(), "scheduled task iteration exceeded its deadline, cancelled"),
                            }
                        }
                        _ = shutdown_rx.notified() => break,
                    }
                }
            });

            self.running.push(Running { name, handle, shutdown });
        }
    }

    /// Signal every task to stop and wait up to `drain_timeout` for
    /// in-flight iterations to finish. Tasks that do not finish in time are
    /// aborted.
    pub async fn shutdown(self, drain_timeout: Duration) {
        for running in &self.running {
            running.shutdown.notify_one();
        }
        for running in self.running {
            match tokio::time::timeout(drain_timeout, running.handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(task = %running.name, "did not shut down within drain timeout, leaving it to process exit");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    struct CountingTask {
        name: &'static str,
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ScheduledTask for CountingTask {
        fn name(&self) -> &str {
            self.name
        }
        async fn run_once(&self) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn schedule_runs_task_on_its_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = Arc::new(CountingTask { name: "counter", count: count.clone() });
        let mut orchestrator = Orchestrator::new();
        orchestrator.start(vec![Schedule::new(task, StdDuration::from_millis(20))]);

        tokio::time::sleep(StdDuration::from_millis(90)).await;
        orchestrator.shutdown(StdDuration::from_millis(500)).await;

        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    struct FailingTask {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ScheduledTask for FailingTask {
        fn name(&self) -> &str {
            "failing"
        }
        async fn run_once(&self) -> Result<()> {
            let n = self.count.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(TaskError::Vault(ledgercore_vault::VaultError::MalformedMarker));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn a_failing_iteration_does_not_stop_the_next_one() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = Arc::new(FailingTask { count: count.clone() });
        let mut orchestrator = Orchestrator::new();
        orchestrator.start(vec![Schedule::new(task, StdDuration::from_millis(15))]);

        tokio::time::sleep(StdDuration::from_millis(80)).await;
        orchestrator.shutdown(StdDuration::from_millis(500)).await;

        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
