use serde::Serialize;
use tracing::info;

use super::Daemon;
use crate::agents::ZombieCleanup;
use crate::error::DaemonError;
use crate::events::LogLevel;

/// What startup reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub zombies: ZombieCleanup,
    /// Task ids moved from in-progress back to pending.
    pub orphaned_tasks: Vec<String>,
}

impl Daemon {
    /// Bring persisted state back in line with reality: close agent records
    /// whose process is gone, then return in-progress tasks without a running
    /// agent to pending. Outstanding dispatches from a previous run are void.
    pub async fn reconcile(&self) -> Result<RecoveryReport, DaemonError> {
        let zombies = self.cleanup_zombies().await?;

        let running = self.state.load().await?.running_task_ids();
        let orphaned_tasks = self.tasks.reset_orphans(&running).await?;
        if !orphaned_tasks.is_empty() {
            self.events.log(
                LogLevel::Warn,
                format!(
                    "Reset {} orphaned task(s) to pending: {}",
                    orphaned_tasks.len(),
                    orphaned_tasks.join(", ")
                ),
            );
        }

        self.state.update(|s| s.dispatched.clear()).await?;
        info!(
            zombies = zombies.cleaned.len(),
            orphans = orphaned_tasks.len(),
            "Startup reconciliation complete"
        );
        Ok(RecoveryReport {
            zombies,
            orphaned_tasks,
        })
    }
}
