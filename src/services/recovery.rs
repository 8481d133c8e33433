use std::sync::Arc;

use crate::services::queue::{QueueError, TaskQueue};
use crate::services::store::StatusStore;

/// Startup scan that hands tasks interrupted by a crash back to the worker.
pub struct RecoveryScanner {
    store: Arc<dyn StatusStore>,
    queue: Arc<TaskQueue>,
}

impl RecoveryScanner {
    pub fn new(store: Arc<dyn StatusStore>, queue: Arc<TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// Re-enqueue every non-terminal task, oldest first. Returns how many
    /// were newly queued; tasks already queued are left alone, so a second
    /// run is harmless.
    pub async fn run_once(&self) -> Result<usize, QueueError> {
        let tasks = self.store.incomplete_tasks().await?;
        if tasks.is_empty() {
            tracing::info!("Recovery found no interrupted import tasks");
            return Ok(0);
        }

        let mut resumed = 0;
        for task in &tasks {
            tracing::info!(
                task_id = %task.id,
                game_id = ?task.game_id,
                status = %task.status,
                completed = task.completed_item_count(),
                items = task.items.len(),
                "Recovering interrupted import task"
            );
            if self.queue.resume(task.id).await? {
                resumed += 1;
            }
        }

        tracing::info!(found = tasks.len(), resumed, "Recovery scan finished");
        Ok(resumed)
    }
}
