use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::models::media::FilePurpose;
use crate::models::task::{ImportItem, ResourceType};

/// Extension used for generated thumbnails.
pub const THUMBNAIL_EXTENSION: &str = "jpg";

/// Whether a source file is a still image or a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
}

/// One file the pipeline must end up storing for an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOutput {
    pub source: PathBuf,
    pub purpose: FilePurpose,
    pub name_modifier: Option<String>,
    pub extension: String,
    /// Bounding box for thumbnails.
    pub max_dimension: Option<u32>,
}

impl PlannedOutput {
    /// File name used both in scratch space and in the storage key.
    pub fn file_stem(&self) -> String {
        let purpose = match self.purpose {
            FilePurpose::Original => "original",
            FilePurpose::AlternateFormat => "alternate",
            FilePurpose::Thumbnail => "thumb",
        };
        match &self.name_modifier {
            Some(m) => format!("{purpose}-{m}"),
            None => purpose.to_string(),
        }
    }
}

/// Which extensions are accepted and which derivatives each one needs.
#[derive(Debug, Clone)]
pub struct FormatPolicy {
    photo_extensions: HashSet<String>,
    video_extensions: HashSet<String>,
    alternates: HashMap<String, String>,
    thumbnail_sizes: Vec<u32>,
}

/// Lower-cased extension of a path, without the dot.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn normalize(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

impl FormatPolicy {
    pub fn new<I, J>(photo_extensions: I, video_extensions: J) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        J: IntoIterator,
        J::Item: AsRef<str>,
    {
        Self {
            photo_extensions: photo_extensions.into_iter().map(|e| normalize(e.as_ref())).collect(),
            video_extensions: video_extensions.into_iter().map(|e| normalize(e.as_ref())).collect(),
            alternates: HashMap::new(),
            thumbnail_sizes: Vec::new(),
        }
    }

    pub fn with_alternate(mut self, source: &str, target: &str) -> Self {
        self.alternates.insert(normalize(source), normalize(target));
        self
    }

    pub fn with_thumbnail_sizes(mut self, sizes: impl Into<Vec<u32>>) -> Self {
        self.thumbnail_sizes = sizes.into();
        self
    }

    /// Build from `PHOTO_EXTENSIONS`, `VIDEO_EXTENSIONS`, `ALTERNATE_FORMATS`
    /// and `THUMBNAIL_SIZES`.
    pub fn from_config(config: &AppConfig) -> Result<Self, FormatError> {
        let mut policy = Self::new(&config.photo_extensions, &config.video_extensions)
            .with_thumbnail_sizes(config.thumbnail_sizes.clone());

        for pair in &config.alternate_formats {
            let (source, target) = pair
                .split_once(':')
                .ok_or_else(|| FormatError::InvalidMapping(pair.clone()))?;
            if source.trim().is_empty() || target.trim().is_empty() {
                return Err(FormatError::InvalidMapping(pair.clone()));
            }
            policy = policy.with_alternate(source, target);
        }
        Ok(policy)
    }

    pub fn kind_of(&self, extension: &str) -> Option<MediaKind> {
        let ext = normalize(extension);
        if self.photo_extensions.contains(&ext) {
            Some(MediaKind::Photo)
        } else if self.video_extensions.contains(&ext) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }

    /// Web-safe target for a source extension, if it needs one.
    pub fn alternate_for(&self, extension: &str) -> Option<&str> {
        self.alternates.get(&normalize(extension)).map(String::as_str)
    }

    pub fn thumbnail_sizes(&self) -> &[u32] {
        &self.thumbnail_sizes
    }

    /// Every output an item must produce, originals first.
    ///
    /// Fails with [`FormatError`] for inputs that can never succeed: missing
    /// sources for the declared resource type, or unsupported extensions.
    pub fn plan(
        &self,
        item: &ImportItem,
        alternate_format_override: bool,
    ) -> Result<Vec<PlannedOutput>, FormatError> {
        let photo = item.source_photo_path.as_deref();
        let video = item.source_video_path.as_deref();

        let (photo, video) = match item.resource_type {
            ResourceType::Photo => (Some(photo.ok_or(FormatError::MissingPhoto)?), None),
            ResourceType::Video => (None, Some(video.ok_or(FormatError::MissingVideo)?)),
            ResourceType::LivePhoto => (
                Some(photo.ok_or(FormatError::MissingPhoto)?),
                Some(video.ok_or(FormatError::MissingVideo)?),
            ),
        };

        let mut outputs = Vec::new();
        for (source, expected) in [(photo, MediaKind::Photo), (video, MediaKind::Video)] {
            let Some(source) = source else { continue };
            let ext = extension_of(source).ok_or_else(|| FormatError::Unsupported(source.display().to_string()))?;
            if self.kind_of(&ext) != Some(expected) {
                return Err(FormatError::Unsupported(source.display().to_string()));
            }

            outputs.push(PlannedOutput {
                source: source.to_path_buf(),
                purpose: FilePurpose::Original,
                name_modifier: None,
                extension: ext.clone(),
                max_dimension: None,
            });

            if !alternate_format_override {
                if let Some(target) = self.alternate_for(&ext) {
                    outputs.push(PlannedOutput {
                        source: source.to_path_buf(),
                        purpose: FilePurpose::AlternateFormat,
                        name_modifier: None,
                        extension: target.to_string(),
                        max_dimension: None,
                    });
                }
            }
        }

        // Thumbnails come from the still when there is one.
        if let Some(visual) = photo.or(video) {
            for size in &self.thumbnail_sizes {
                outputs.push(PlannedOutput {
                    source: visual.to_path_buf(),
                    purpose: FilePurpose::Thumbnail,
                    name_modifier: Some(size.to_string()),
                    extension: THUMBNAIL_EXTENSION.to_string(),
                    max_dimension: Some(*size),
                });
            }
        }

        Ok(outputs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("photo source is missing")]
    MissingPhoto,

    #[error("video source is missing")]
    MissingVideo,

    #[error("unsupported source format: {0}")]
    Unsupported(String),

    #[error("invalid alternate format mapping '{0}', expected source:target")]
    InvalidMapping(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> FormatPolicy {
        FormatPolicy::new(["jpg", "heic"], ["mp4", "mov"])
            .with_alternate("heic", "jpg")
            .with_alternate(".MOV", "mp4")
            .with_thumbnail_sizes(vec![256])
    }

    fn purposes(outputs: &[PlannedOutput]) -> Vec<(FilePurpose, String)> {
        outputs
            .iter()
            .map(|o| (o.purpose, o.extension.clone()))
            .collect()
    }

    #[test]
    fn test_web_safe_photo_needs_no_alternate() {
        let item = ImportItem::new(0, "IMG_1", ResourceType::Photo).with_photo("/t/IMG_1.JPG", "IMG_1.JPG");
        let outputs = policy().plan(&item, false).unwrap();
        assert_eq!(
            purposes(&outputs),
            vec![
                (FilePurpose::Original, "jpg".to_string()),
                (FilePurpose::Thumbnail, "jpg".to_string()),
            ]
        );
        assert_eq!(outputs[1].name_modifier.as_deref(), Some("256"));
    }

    #[test]
    fn test_live_photo_plans_both_alternates() {
        let item = ImportItem::new(0, "IMG_2", ResourceType::LivePhoto)
            .with_photo("/t/IMG_2.heic", "IMG_2.heic")
            .with_video("/t/IMG_2.mov", "IMG_2.mov");
        let outputs = policy().plan(&item, false).unwrap();
        assert_eq!(
            purposes(&outputs),
            vec![
                (FilePurpose::Original, "heic".to_string()),
                (FilePurpose::AlternateFormat, "jpg".to_string()),
                (FilePurpose::Original, "mov".to_string()),
                (FilePurpose::AlternateFormat, "mp4".to_string()),
                (FilePurpose::Thumbnail, "jpg".to_string()),
            ]
        );
        assert_eq!(outputs[4].source, PathBuf::from("/t/IMG_2.heic"));
    }

    #[test]
    fn test_override_skips_alternates() {
        let item = ImportItem::new(0, "IMG_3", ResourceType::Photo).with_photo("/t/IMG_3.heic", "IMG_3.heic");
        let outputs = policy().plan(&item, true).unwrap();
        assert!(outputs.iter().all(|o| o.purpose != FilePurpose::AlternateFormat));
    }

    #[test]
    fn test_live_photo_without_video_is_rejected() {
        let item = ImportItem::new(0, "IMG_4", ResourceType::LivePhoto).with_photo("/t/IMG_4.jpg", "IMG_4.jpg");
        assert!(matches!(policy().plan(&item, false), Err(FormatError::MissingVideo)));
    }

    #[test]
    fn test_unsupported_extension_is_rejected() {
        let item = ImportItem::new(0, "notes", ResourceType::Photo).with_photo("/t/notes.txt", "notes.txt");
        assert!(matches!(policy().plan(&item, false), Err(FormatError::Unsupported(_))));
    }

    #[test]
    fn test_mapping_parse_errors() {
        let mut config: AppConfig = envy::from_iter([
            ("S3_BUCKET".to_string(), "b".to_string()),
            ("S3_ENDPOINT".to_string(), "e".to_string()),
            ("S3_ACCESS_KEY".to_string(), "a".to_string()),
            ("S3_SECRET_KEY".to_string(), "s".to_string()),
        ])
        .unwrap();
        assert!(FormatPolicy::from_config(&config).is_ok());

        config.alternate_formats = vec!["heic".to_string()];
        assert!(matches!(
            FormatPolicy::from_config(&config),
            Err(FormatError::InvalidMapping(_))
        ));
    }
}
