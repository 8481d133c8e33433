use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::media::MediaResource;
use crate::models::task::{ImportStatus, ImportTask};
use crate::services::store::{StatusStore, StoreError};

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, ImportTask>,
    media: HashMap<Uuid, MediaResource>,
}

/// In-process status store for local runs and tests.
///
/// State lives only as long as the process, so nothing here survives a
/// restart; production deployments use the Postgres store.
#[derive(Default)]
pub struct MemoryStatusStore {
    inner: Mutex<Inner>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored media resources.
    pub async fn media_count(&self) -> usize {
        self.inner.lock().await.media.len()
    }

    /// Overwrite a task record as-is, e.g. to stage state left by a crash.
    pub async fn put_task(&self, task: ImportTask) {
        self.inner.lock().await.tasks.insert(task.id, task);
    }
}

impl Inner {
    fn active_for_game(&self, game_id: Uuid) -> Option<&ImportTask> {
        self.tasks
            .values()
            .find(|t| t.game_id == Some(game_id) && t.status.is_pending())
    }

    fn task_mut(&mut self, task_id: Uuid) -> Result<&mut ImportTask, StoreError> {
        self.tasks.get_mut(&task_id).ok_or(StoreError::NotFound(task_id))
    }
}

#[async_trait::async_trait]
impl StatusStore for MemoryStatusStore {
    async fn create_task(&self, task: &ImportTask) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(game_id) = task.game_id {
            if inner.active_for_game(game_id).is_some() {
                return Err(StoreError::Conflict(game_id));
            }
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<ImportTask>, StoreError> {
        Ok(self.inner.lock().await.tasks.get(&task_id).cloned())
    }

    async fn active_task_for_game(&self, game_id: Uuid) -> Result<Option<ImportTask>, StoreError> {
        Ok(self.inner.lock().await.active_for_game(game_id).cloned())
    }

    async fn incomplete_tasks(&self) -> Result<Vec<ImportTask>, StoreError> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<ImportTask> = inner
            .tasks
            .values()
            .filter(|t| t.status.is_pending())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn mark_task_started(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ImportTask, StoreError> {
        let mut inner = self.inner.lock().await;
        let task = inner.task_mut(task_id)?;
        if task.status == ImportStatus::Queued {
            task.status = ImportStatus::Started;
            task.started_at.get_or_insert(now);
        }
        Ok(task.clone())
    }

    async fn transition_item(
        &self,
        task_id: Uuid,
        item_id: Uuid,
        from: &[ImportStatus],
        to: ImportStatus,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<ImportTask>, StoreError> {
        let mut inner = self.inner.lock().await;
        let task = inner.task_mut(task_id)?;
        let item = task
            .item_mut(item_id)
            .ok_or_else(|| StoreError::Corrupt(format!("item {item_id} not in task {task_id}")))?;

        if !from.contains(&item.status) {
            return Ok(None);
        }
        item.apply_transition(to, message, now);
        task.refresh_aggregate(now);
        Ok(Some(task.clone()))
    }

    async fn restart_task(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<ImportTask, StoreError> {
        let mut inner = self.inner.lock().await;
        let (status, game_id) = {
            let task = inner.tasks.get(&task_id).ok_or(StoreError::NotFound(task_id))?;
            (task.status, task.game_id)
        };
        if status != ImportStatus::Failed {
            return Err(StoreError::InvalidState {
                task_id,
                status,
                expected: ImportStatus::Failed,
            });
        }
        if let Some(game_id) = game_id {
            if inner.active_for_game(game_id).is_some() {
                return Err(StoreError::Conflict(game_id));
            }
        }

        let task = inner.task_mut(task_id)?;
        task.reset_for_restart(now);
        Ok(task.clone())
    }

    async fn save_media_resource(&self, resource: &MediaResource) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.media.get_mut(&resource.asset_identifier) {
            Some(existing) => {
                existing.game_id = resource.game_id;
                existing.resource_type = resource.resource_type;
                existing.alternate_format_override = resource.alternate_format_override;
                for file in &resource.files {
                    match existing.files.iter_mut().find(|f| f.slot() == file.slot()) {
                        Some(current) => *current = file.clone(),
                        None => existing.files.push(file.clone()),
                    }
                }
            }
            None => {
                inner.media.insert(resource.asset_identifier, resource.clone());
            }
        }
        Ok(())
    }

    async fn get_media_resource(
        &self,
        asset_identifier: Uuid,
    ) -> Result<Option<MediaResource>, StoreError> {
        Ok(self.inner.lock().await.media.get(&asset_identifier).cloned())
    }

    async fn referenced_temp_paths(&self) -> Result<HashSet<PathBuf>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.status.is_pending())
            .flat_map(|t| t.items.iter())
            .flat_map(|i| i.source_paths().cloned())
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
