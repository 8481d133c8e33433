use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::task::ResourceType;

/// Namespace for deriving asset identifiers from `(game, base name)`.
const ASSET_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_3c2a_9b4e_4f5a_8c7d_2e1b_0a9f_8e7d);

/// Why a stored file exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
pub enum FilePurpose {
    Original,
    AlternateFormat,
    Thumbnail,
}

/// A file held in remote object storage for a media resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteFile {
    pub purpose: FilePurpose,
    /// Size label for thumbnails; absent for originals and alternate formats.
    pub name_modifier: Option<String>,
    pub extension: String,
    pub content_type: String,
    pub storage_key: String,
}

impl RemoteFile {
    /// Identity within a resource. Saving a file into an occupied slot
    /// replaces it.
    pub fn slot(&self) -> (Option<&str>, &str) {
        (self.name_modifier.as_deref(), self.extension.as_str())
    }
}

/// Durable result of a completed import item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaResource {
    pub asset_identifier: Uuid,
    pub game_id: Option<Uuid>,
    pub resource_type: ResourceType,
    pub favorite: bool,
    pub alternate_format_override: bool,
    pub files: Vec<RemoteFile>,
}

/// Stable identifier for a logical asset.
///
/// Scoped by game when known, otherwise by the submitting task, so retries
/// and re-imports of the same base name land on the same resource.
pub fn asset_identifier(game_id: Option<Uuid>, task_id: Uuid, base_name: &str) -> Uuid {
    let scope = game_id.unwrap_or(task_id);
    let name = format!("{}/{}", scope, base_name.to_lowercase());
    Uuid::new_v5(&ASSET_NAMESPACE, name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_identifier_is_stable() {
        let game = Uuid::new_v4();
        let a = asset_identifier(Some(game), Uuid::new_v4(), "IMG_0042");
        let b = asset_identifier(Some(game), Uuid::new_v4(), "img_0042");
        assert_eq!(a, b);
    }

    #[test]
    fn test_asset_identifier_differs_per_game() {
        let task = Uuid::new_v4();
        let a = asset_identifier(Some(Uuid::new_v4()), task, "IMG_0042");
        let b = asset_identifier(Some(Uuid::new_v4()), task, "IMG_0042");
        assert_ne!(a, b);
    }

    #[test]
    fn test_pending_game_scopes_by_task() {
        let task = Uuid::new_v4();
        assert_eq!(
            asset_identifier(None, task, "clip"),
            asset_identifier(None, task, "clip")
        );
        assert_ne!(
            asset_identifier(None, task, "clip"),
            asset_identifier(None, Uuid::new_v4(), "clip")
        );
    }
}
