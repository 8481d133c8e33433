use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::task::{ImportItem, ImportTask, ResourceType};
use crate::services::formats::{extension_of, FormatPolicy, MediaKind};
use crate::services::queue::{QueueError, TaskQueue};
use crate::services::store::{StatusStore, StoreError};

/// One file received in an upload batch.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// A grouped asset before its files are written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedItem {
    pub base_name: String,
    pub resource_type: ResourceType,
    pub photo: Option<String>,
    pub video: Option<String>,
}

/// Group file names into assets by case-insensitive stem.
///
/// A photo and a video sharing a stem become one live photo. Extra files
/// with an already used stem and kind become assets of their own, named
/// after the full file name. Base names are unique within a batch, compared
/// case-insensitively. Files with unknown extensions still produce an item
/// so the client sees why they were not imported.
pub fn group_uploads(file_names: &[String], policy: &FormatPolicy) -> Vec<PlannedItem> {
    let mut items: Vec<PlannedItem> = Vec::new();
    let mut by_stem: HashMap<String, usize> = HashMap::new();
    let mut used: HashSet<String> = HashSet::new();

    for name in file_names {
        let path = Path::new(name);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        let kind = extension_of(path).and_then(|ext| policy.kind_of(&ext));

        let slot = by_stem.get(&stem.to_lowercase()).copied().filter(|&i| {
            let item = &items[i];
            match kind {
                Some(MediaKind::Photo) => item.photo.is_none() && item.video.is_some(),
                Some(MediaKind::Video) => item.video.is_none() && item.photo.is_some(),
                None => false,
            }
        });

        match slot {
            Some(i) => {
                let item = &mut items[i];
                match kind {
                    Some(MediaKind::Photo) => item.photo = Some(name.clone()),
                    _ => item.video = Some(name.clone()),
                }
                item.resource_type = ResourceType::LivePhoto;
            }
            None => {
                let base_name = if !used.contains(&stem.to_lowercase()) {
                    by_stem.insert(stem.to_lowercase(), items.len());
                    stem
                } else {
                    unique_name(name, &used)
                };
                used.insert(base_name.to_lowercase());
                let item = match kind {
                    Some(MediaKind::Video) => PlannedItem {
                        base_name,
                        resource_type: ResourceType::Video,
                        photo: None,
                        video: Some(name.clone()),
                    },
                    // Unknown formats ride along as photos and fail in the
                    // pipeline as unsupported.
                    _ => PlannedItem {
                        base_name,
                        resource_type: ResourceType::Photo,
                        photo: Some(name.clone()),
                        video: None,
                    },
                };
                items.push(item);
            }
        }
    }

    items
}

/// `name`, or `name-2`, `name-3`, ... if already taken.
fn unique_name(name: &str, used: &HashSet<String>) -> String {
    if !used.contains(&name.to_lowercase()) {
        return name.to_string();
    }
    (2..)
        .map(|n| format!("{name}-{n}"))
        .find(|candidate| !used.contains(&candidate.to_lowercase()))
        .unwrap_or_else(|| name.to_string())
}

/// Reduce a client-supplied name to a bare file name.
fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = Path::new(raw.trim()).file_name()?.to_str()?.to_string();
    if name.is_empty() || name.starts_with('.') {
        return None;
    }
    Some(name)
}

/// Submission and polling operations exposed to clients.
pub struct ImportService {
    store: Arc<dyn StatusStore>,
    queue: Arc<TaskQueue>,
    policy: Arc<FormatPolicy>,
    temp_root: PathBuf,
}

impl ImportService {
    pub fn new(
        store: Arc<dyn StatusStore>,
        queue: Arc<TaskQueue>,
        policy: Arc<FormatPolicy>,
        temp_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            queue,
            policy,
            temp_root: temp_root.into(),
        }
    }

    /// Stage an upload batch and queue it for import.
    pub async fn submit(
        &self,
        game_id: Option<Uuid>,
        files: Vec<UploadedFile>,
        alternate_format_override: bool,
    ) -> Result<ImportTask, ImportError> {
        if files.is_empty() {
            return Err(ImportError::EmptyBatch);
        }

        let mut names = Vec::with_capacity(files.len());
        let mut seen = HashSet::new();
        for file in &files {
            let name = sanitize_file_name(&file.file_name)
                .ok_or_else(|| ImportError::InvalidFileName(file.file_name.clone()))?;
            if !seen.insert(name.to_lowercase()) {
                return Err(ImportError::DuplicateFileName(name));
            }
            names.push(name);
        }

        // Cheap early rejection; the store has the final word.
        if let Some(game_id) = game_id {
            if self.store.active_task_for_game(game_id).await?.is_some() {
                return Err(ImportError::Conflict(game_id));
            }
        }

        let mut task = ImportTask::new(game_id, Vec::new());
        let dir = self.temp_root.join(task.id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let staged = self.stage(&dir, &names, files).await;
        if let Err(e) = staged {
            self.discard(&dir).await;
            return Err(e.into());
        }

        task.items = group_uploads(&names, &self.policy)
            .into_iter()
            .enumerate()
            .map(|(position, planned)| {
                let mut item = ImportItem::new(position as i32, planned.base_name, planned.resource_type)
                    .with_alternate_format_override(alternate_format_override);
                if let Some(photo) = planned.photo {
                    item = item.with_photo(dir.join(&photo), photo);
                }
                if let Some(video) = planned.video {
                    item = item.with_video(dir.join(&video), video);
                }
                item
            })
            .collect();

        if let Err(e) = self.queue.submit(&task).await {
            self.discard(&dir).await;
            return Err(e.into());
        }
        Ok(task)
    }

    async fn stage(&self, dir: &Path, names: &[String], files: Vec<UploadedFile>) -> std::io::Result<()> {
        for (name, file) in names.iter().zip(files) {
            tokio::fs::write(dir.join(name), &file.data).await?;
        }
        Ok(())
    }

    async fn discard(&self, dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            tracing::warn!(path = %dir.display(), error = %e, "Failed to discard staged upload");
        }
    }

    pub async fn status(&self, task_id: Uuid) -> Result<ImportTask, ImportError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(ImportError::NotFound(task_id))
    }

    /// Zero or one non-terminal task for the game.
    pub async fn active_for_game(&self, game_id: Uuid) -> Result<Option<ImportTask>, ImportError> {
        Ok(self.store.active_task_for_game(game_id).await?)
    }

    /// Re-run the unfinished items of a failed task.
    pub async fn restart(&self, task_id: Uuid) -> Result<ImportTask, ImportError> {
        let task = self.store.restart_task(task_id, Utc::now()).await?;
        self.queue.resume(task_id).await?;
        tracing::info!(
            task_id = %task_id,
            pending = task.items.len() - task.completed_item_count(),
            "Import task restarted"
        );
        Ok(task)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("No files were uploaded")]
    EmptyBatch,

    #[error("Invalid file name '{0}'")]
    InvalidFileName(String),

    #[error("File '{0}' was uploaded more than once")]
    DuplicateFileName(String),

    #[error("Game {0} already has an active import task")]
    Conflict(Uuid),

    #[error("Import task {0} not found")]
    NotFound(Uuid),

    #[error("{0}")]
    InvalidState(String),

    #[error("Task queue is stopped")]
    Unavailable,

    #[error(transparent)]
    Store(StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for ImportError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(game_id) => ImportError::Conflict(game_id),
            StoreError::NotFound(task_id) => ImportError::NotFound(task_id),
            e @ StoreError::InvalidState { .. } => ImportError::InvalidState(e.to_string()),
            other => ImportError::Store(other),
        }
    }
}

impl From<QueueError> for ImportError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Conflict(game_id) => ImportError::Conflict(game_id),
            QueueError::Stopped => ImportError::Unavailable,
            QueueError::Store(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> FormatPolicy {
        FormatPolicy::new(["jpg", "heic"], ["mov", "mp4"])
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_photo_and_video_with_same_stem_form_live_photo() {
        let items = group_uploads(&names(&["IMG_1.HEIC", "img_1.mov", "IMG_2.jpg"]), &policy());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].resource_type, ResourceType::LivePhoto);
        assert_eq!(items[0].base_name, "IMG_1");
        assert_eq!(items[0].photo.as_deref(), Some("IMG_1.HEIC"));
        assert_eq!(items[0].video.as_deref(), Some("img_1.mov"));
        assert_eq!(items[1].resource_type, ResourceType::Photo);
    }

    #[test]
    fn test_second_photo_with_same_stem_is_separate_asset() {
        let items = group_uploads(&names(&["IMG_1.jpg", "IMG_1.heic"]), &policy());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].base_name, "IMG_1");
        assert_eq!(items[1].base_name, "IMG_1.heic");
        assert!(items.iter().all(|i| i.resource_type == ResourceType::Photo));
    }

    #[test]
    fn test_full_name_bases_are_reserved() {
        let items = group_uploads(&names(&["a.jpg", "a.heic", "a.heic.jpg"]), &policy());
        let bases: Vec<&str> = items.iter().map(|i| i.base_name.as_str()).collect();
        assert_eq!(bases, vec!["a", "a.heic", "a.heic.jpg"]);

        let items = group_uploads(&names(&["a.heic.jpg", "a.jpg", "a.heic"]), &policy());
        let bases: Vec<&str> = items.iter().map(|i| i.base_name.as_str()).collect();
        assert_eq!(bases, vec!["a.heic", "a", "a.heic-2"]);

        let task = uuid::Uuid::new_v4();
        let game = Some(uuid::Uuid::new_v4());
        let assets: HashSet<_> = items
            .iter()
            .map(|i| crate::models::media::asset_identifier(game, task, &i.base_name))
            .collect();
        assert_eq!(assets.len(), items.len());
    }

    #[test]
    fn test_unknown_extension_still_yields_item() {
        let items = group_uploads(&names(&["lineup.pdf"]), &policy());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].photo.as_deref(), Some("lineup.pdf"));
    }

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_file_name("dir/IMG_1.jpg").as_deref(), Some("IMG_1.jpg"));
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name(".hidden"), None);
    }
}
