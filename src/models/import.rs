use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::task::{ImportItem, ImportStatus, ImportTask, ResourceType};

/// Status of an import task as exposed to polling clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: Uuid,
    pub game_id: Option<Uuid>,
    pub status: ImportStatus,
    pub message: Option<String>,
    pub progress: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub items: Vec<ItemView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemView {
    pub id: Uuid,
    pub base_name: String,
    pub resource_type: ResourceType,
    pub status: ImportStatus,
    pub message: Option<String>,
}

impl From<&ImportItem> for ItemView {
    fn from(item: &ImportItem) -> Self {
        Self {
            id: item.id,
            base_name: item.base_name.clone(),
            resource_type: item.resource_type,
            status: item.status,
            message: item.message.clone(),
        }
    }
}

impl From<&ImportTask> for TaskView {
    fn from(task: &ImportTask) -> Self {
        Self {
            id: task.id,
            game_id: task.game_id,
            status: task.status,
            message: task.message.clone(),
            progress: task.progress(),
            start_time: task.started_at,
            end_time: task.completed_at,
            items: task.items.iter().map(ItemView::from).collect(),
        }
    }
}

/// Error body returned by the import endpoints.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
