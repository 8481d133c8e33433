use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::media::asset_identifier;
use crate::models::task::{ImportItem, ImportStatus, ImportTask};
use crate::services::pipeline::ImportPipeline;
use crate::services::queue::TaskQueue;
use crate::services::store::{StatusStore, StoreError};

/// The single consumer of the task queue.
///
/// Items run one at a time in stored order, and every transition is
/// persisted before the next step so progress is visible mid-task. Only
/// status store failures stop the loop.
pub struct Worker {
    store: Arc<dyn StatusStore>,
    queue: Arc<TaskQueue>,
    pipeline: Arc<ImportPipeline>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn StatusStore>,
        queue: Arc<TaskQueue>,
        pipeline: Arc<ImportPipeline>,
    ) -> Self {
        Self {
            store,
            queue,
            pipeline,
        }
    }

    /// Drain the queue until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), StoreError> {
        tracing::info!("Import worker ready, waiting for tasks");

        while let Some(task_id) = self.queue.dequeue(&shutdown).await {
            let result = self.process_task(task_id).await;
            self.queue.finish(task_id).await;

            if let Err(e) = result {
                tracing::error!(task_id = %task_id, error = %e, "Status store failure, stopping worker");
                return Err(e);
            }
        }

        tracing::info!("Import worker stopped");
        Ok(())
    }

    /// Run every pending item of a task. Returns the task's final record, or
    /// `None` if the task no longer exists.
    pub async fn process_task(&self, task_id: Uuid) -> Result<Option<ImportTask>, StoreError> {
        let task = match self.store.get_task(task_id).await? {
            Some(t) => t,
            None => {
                tracing::warn!(task_id = %task_id, "Dequeued unknown import task, skipping");
                return Ok(None);
            }
        };
        if task.status.is_terminal() {
            tracing::debug!(task_id = %task_id, status = %task.status, "Task already finished, skipping");
            return Ok(Some(task));
        }

        let mut task = self.store.mark_task_started(task_id, Utc::now()).await?;
        tracing::info!(
            task_id = %task.id,
            game_id = ?task.game_id,
            items = task.items.len(),
            completed = task.completed_item_count(),
            "Processing import task"
        );

        let items: Vec<ImportItem> = task.items.clone();
        for item in &items {
            // Completed items are never redone; failed ones wait for an
            // explicit restart.
            if item.status.is_terminal() {
                continue;
            }
            if let Some(updated) = self.process_item(&task, item).await? {
                task = updated;
            }
        }

        match task.status {
            ImportStatus::Completed => tracing::info!(task_id = %task.id, "Import task completed"),
            ImportStatus::Failed => tracing::warn!(
                task_id = %task.id,
                reason = task.message.as_deref().unwrap_or(""),
                "Import task finished with failures"
            ),
            status => tracing::warn!(task_id = %task.id, status = %status, "Import task left unfinished"),
        }
        Ok(Some(task))
    }

    async fn process_item(
        &self,
        task: &ImportTask,
        item: &ImportItem,
    ) -> Result<Option<ImportTask>, StoreError> {
        let started = self
            .store
            .transition_item(
                task.id,
                item.id,
                &[ImportStatus::Queued, ImportStatus::Started],
                ImportStatus::Started,
                None,
                Utc::now(),
            )
            .await?;
        if started.is_none() {
            tracing::debug!(task_id = %task.id, item_id = %item.id, "Item changed concurrently, skipping");
            return Ok(None);
        }

        let asset = asset_identifier(task.game_id, task.id, &item.base_name);
        let existing = self.store.get_media_resource(asset).await?;

        let clock = Instant::now();
        let outcome = self.pipeline.run_item(task, item, existing.as_ref()).await;
        metrics::histogram!("media_import_item_seconds").record(clock.elapsed().as_secs_f64());

        let updated = match outcome {
            Ok(resource) => {
                self.store.save_media_resource(&resource).await?;
                self.pipeline.prune_superseded(existing.as_ref(), &resource).await;
                metrics::counter!("media_import_items_completed").increment(1);
                tracing::info!(
                    task_id = %task.id,
                    item_id = %item.id,
                    asset = %resource.asset_identifier,
                    files = resource.files.len(),
                    "Item imported"
                );
                self.store
                    .transition_item(
                        task.id,
                        item.id,
                        &[ImportStatus::Started],
                        ImportStatus::Completed,
                        None,
                        Utc::now(),
                    )
                    .await?
            }
            Err(e) => {
                metrics::counter!("media_import_items_failed").increment(1);
                tracing::warn!(
                    task_id = %task.id,
                    item_id = %item.id,
                    base_name = %item.base_name,
                    error = %e,
                    "Item import failed"
                );
                self.store
                    .transition_item(
                        task.id,
                        item.id,
                        &[ImportStatus::Started],
                        ImportStatus::Failed,
                        Some(e.to_string()),
                        Utc::now(),
                    )
                    .await?
            }
        };

        if updated.is_none() {
            tracing::warn!(task_id = %task.id, item_id = %item.id, "Item left Started state during import");
        }
        Ok(updated)
    }
}
