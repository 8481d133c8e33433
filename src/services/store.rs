use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

use crate::models::media::MediaResource;
use crate::models::task::{ImportStatus, ImportTask};

/// Durable record of import tasks, their items, and the media they produce.
///
/// Every mutating call is an atomic read-modify-write of one task, so a
/// client-triggered restart and an in-flight worker update cannot lose each
/// other's changes.
#[async_trait::async_trait]
pub trait StatusStore: Send + Sync {
    /// Persist a new `Queued` task. Fails with [`StoreError::Conflict`] when
    /// the game already has a non-terminal task.
    async fn create_task(&self, task: &ImportTask) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<ImportTask>, StoreError>;

    /// The non-terminal task for a game, if any.
    async fn active_task_for_game(&self, game_id: Uuid) -> Result<Option<ImportTask>, StoreError>;

    /// Every non-terminal task, oldest first.
    async fn incomplete_tasks(&self) -> Result<Vec<ImportTask>, StoreError>;

    /// Move a `Queued` task to `Started`. `started_at` is only stamped the
    /// first time; an already started task is returned unchanged.
    async fn mark_task_started(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ImportTask, StoreError>;

    /// Compare-and-set an item's status, then recompute the task aggregate.
    ///
    /// Returns `Ok(None)` when the item's current status is not in `from`.
    async fn transition_item(
        &self,
        task_id: Uuid,
        item_id: Uuid,
        from: &[ImportStatus],
        to: ImportStatus,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<ImportTask>, StoreError>;

    /// `Failed → Queued`, resetting only the items that did not complete.
    async fn restart_task(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<ImportTask, StoreError>;

    /// Insert or update a resource by asset identifier. Files are keyed by
    /// `(name_modifier, extension)`, so saving twice never duplicates rows.
    async fn save_media_resource(&self, resource: &MediaResource) -> Result<(), StoreError>;

    async fn get_media_resource(
        &self,
        asset_identifier: Uuid,
    ) -> Result<Option<MediaResource>, StoreError>;

    /// Temp files referenced by items of non-terminal tasks.
    async fn referenced_temp_paths(&self) -> Result<HashSet<PathBuf>, StoreError>;

    /// Connectivity check for health endpoints.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Game {0} already has an active import task")]
    Conflict(Uuid),

    #[error("Import task {0} not found")]
    NotFound(Uuid),

    #[error("Import task {task_id} is {status}, expected {expected}")]
    InvalidState {
        task_id: Uuid,
        status: ImportStatus,
        expected: ImportStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}
