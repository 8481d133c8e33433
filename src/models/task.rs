use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status shared by import tasks and their items.
///
/// Stored as text in the status tables and transmitted verbatim to polling
/// clients (`Started` is rendered as "in progress" by the UI).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
pub enum ImportStatus {
    Queued,
    Started,
    Completed,
    Failed,
}

impl ImportStatus {
    /// `Completed` and `Failed` accept no further automatic transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ImportStatus::Completed | ImportStatus::Failed)
    }

    pub fn is_pending(self) -> bool {
        !self.is_terminal()
    }
}

/// Kind of logical asset an item represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Photo,
    Video,
    /// A photo and a video sharing a base name.
    LivePhoto,
}

/// One logical asset within an import task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportItem {
    pub id: Uuid,
    /// Stored order within the task, starting at zero.
    pub position: i32,
    pub base_name: String,
    pub resource_type: ResourceType,
    pub source_photo_path: Option<PathBuf>,
    pub source_photo_name: Option<String>,
    pub source_video_path: Option<PathBuf>,
    pub source_video_name: Option<String>,
    /// Skip alternate-format generation even when the source would need one.
    pub alternate_format_override: bool,
    pub status: ImportStatus,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportItem {
    pub fn new(position: i32, base_name: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            id: Uuid::new_v4(),
            position,
            base_name: base_name.into(),
            resource_type,
            source_photo_path: None,
            source_photo_name: None,
            source_video_path: None,
            source_video_name: None,
            alternate_format_override: false,
            status: ImportStatus::Queued,
            message: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_photo(mut self, path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        self.source_photo_path = Some(path.into());
        self.source_photo_name = Some(name.into());
        self
    }

    pub fn with_video(mut self, path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        self.source_video_path = Some(path.into());
        self.source_video_name = Some(name.into());
        self
    }

    pub fn with_alternate_format_override(mut self, value: bool) -> Self {
        self.alternate_format_override = value;
        self
    }

    /// Temp files this item still refers to.
    pub fn source_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.source_photo_path
            .iter()
            .chain(self.source_video_path.iter())
    }

    /// Apply a status transition, stamping `started_at`/`completed_at` once.
    pub fn apply_transition(&mut self, to: ImportStatus, message: Option<String>, now: DateTime<Utc>) {
        self.status = to;
        match to {
            ImportStatus::Queued => {
                self.message = None;
                self.completed_at = None;
            }
            ImportStatus::Started => {
                self.message = None;
                self.started_at.get_or_insert(now);
            }
            ImportStatus::Completed => {
                self.message = None;
                self.completed_at.get_or_insert(now);
            }
            ImportStatus::Failed => {
                self.message = message;
                self.completed_at.get_or_insert(now);
            }
        }
    }
}

/// One client-submitted batch of media for a game.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportTask {
    pub id: Uuid,
    /// `None` while the game is being created by the same submission.
    pub game_id: Option<Uuid>,
    pub status: ImportStatus,
    pub message: Option<String>,
    pub items: Vec<ImportItem>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportTask {
    pub fn new(game_id: Option<Uuid>, items: Vec<ImportItem>) -> Self {
        Self {
            id: Uuid::new_v4(),
            game_id,
            status: ImportStatus::Queued,
            message: None,
            items,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn completed_item_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == ImportStatus::Completed)
            .count()
    }

    /// Fraction of completed items in `[0, 1]`; `1.0` only when every item completed.
    pub fn progress(&self) -> f64 {
        if self.items.is_empty() {
            return if self.status == ImportStatus::Completed { 1.0 } else { 0.0 };
        }
        self.completed_item_count() as f64 / self.items.len() as f64
    }

    /// Task status derived from its items.
    ///
    /// `Failed` once any item failed and nothing is left pending, `Completed`
    /// only when every item completed, `Started` otherwise.
    pub fn aggregate_status(&self) -> ImportStatus {
        let any_pending = self.items.iter().any(|i| i.status.is_pending());
        let any_failed = self.items.iter().any(|i| i.status == ImportStatus::Failed);

        if any_failed && !any_pending {
            ImportStatus::Failed
        } else if self.items.iter().all(|i| i.status == ImportStatus::Completed) {
            ImportStatus::Completed
        } else {
            ImportStatus::Started
        }
    }

    /// Message of the first failed item in stored order.
    pub fn failure_message(&self) -> Option<String> {
        self.items
            .iter()
            .find(|i| i.status == ImportStatus::Failed)
            .map(|i| {
                let reason = i.message.as_deref().unwrap_or("import failed");
                format!("{}: {}", i.base_name, reason)
            })
    }

    /// Recompute status, message and `completed_at` after an item transition.
    pub fn refresh_aggregate(&mut self, now: DateTime<Utc>) {
        self.status = self.aggregate_status();
        self.message = if self.status == ImportStatus::Failed {
            self.failure_message()
        } else {
            None
        };
        if self.status.is_terminal() {
            self.completed_at.get_or_insert(now);
        }
    }

    pub fn item(&self, item_id: Uuid) -> Option<&ImportItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    pub fn item_mut(&mut self, item_id: Uuid) -> Option<&mut ImportItem> {
        self.items.iter_mut().find(|i| i.id == item_id)
    }

    /// Reset for an explicit restart: non-completed items go back to `Queued`.
    pub fn reset_for_restart(&mut self, now: DateTime<Utc>) {
        for item in self.items.iter_mut().filter(|i| i.status != ImportStatus::Completed) {
            item.apply_transition(ImportStatus::Queued, None, now);
        }
        self.status = ImportStatus::Queued;
        self.message = None;
        self.completed_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with(statuses: &[ImportStatus]) -> ImportTask {
        let items = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut item = ImportItem::new(i as i32, format!("IMG_{i}"), ResourceType::Photo);
                item.status = *s;
                if *s == ImportStatus::Failed {
                    item.message = Some("bad file".to_string());
                }
                item
            })
            .collect();
        ImportTask::new(Some(Uuid::new_v4()), items)
    }

    #[test]
    fn test_aggregate_started_while_items_pending() {
        use ImportStatus::*;
        assert_eq!(task_with(&[Completed, Queued]).aggregate_status(), Started);
        assert_eq!(task_with(&[Failed, Started]).aggregate_status(), Started);
    }

    #[test]
    fn test_aggregate_terminal_states() {
        use ImportStatus::*;
        assert_eq!(task_with(&[Completed, Completed]).aggregate_status(), Completed);
        assert_eq!(task_with(&[Completed, Failed, Completed]).aggregate_status(), Failed);
    }

    #[test]
    fn test_progress_reaches_one_only_when_completed() {
        use ImportStatus::*;
        let mut task = task_with(&[Completed, Failed]);
        task.refresh_aggregate(Utc::now());
        assert_eq!(task.status, Failed);
        assert!((task.progress() - 0.5).abs() < f64::EPSILON);

        let mut task = task_with(&[Completed, Completed]);
        task.refresh_aggregate(Utc::now());
        assert_eq!(task.status, Completed);
        assert_eq!(task.progress(), 1.0);
    }

    #[test]
    fn test_failure_message_uses_first_failed_item() {
        use ImportStatus::*;
        let mut task = task_with(&[Completed, Failed, Failed]);
        task.items[2].message = Some("other".to_string());
        task.refresh_aggregate(Utc::now());
        assert_eq!(task.message.as_deref(), Some("IMG_1: bad file"));
    }

    #[test]
    fn test_completed_at_is_set_once() {
        use ImportStatus::*;
        let first = Utc::now();
        let mut task = task_with(&[Completed]);
        task.refresh_aggregate(first);
        task.refresh_aggregate(first + chrono::Duration::seconds(30));
        assert_eq!(task.completed_at, Some(first));
    }

    #[test]
    fn test_restart_keeps_completed_items() {
        use ImportStatus::*;
        let mut task = task_with(&[Completed, Failed, Failed]);
        task.refresh_aggregate(Utc::now());
        task.reset_for_restart(Utc::now());

        assert_eq!(task.status, Queued);
        assert_eq!(task.message, None);
        assert_eq!(task.completed_at, None);
        assert_eq!(task.items[0].status, Completed);
        assert_eq!(task.items[1].status, Queued);
        assert_eq!(task.items[1].message, None);
        assert_eq!(task.items[2].status, Queued);
    }

    #[test]
    fn test_status_round_trips_through_text() {
        assert_eq!(ImportStatus::Started.to_string(), "Started");
        assert_eq!("Failed".parse::<ImportStatus>().unwrap(), ImportStatus::Failed);
        assert_eq!("LivePhoto".parse::<ResourceType>().unwrap(), ResourceType::LivePhoto);
    }
}
