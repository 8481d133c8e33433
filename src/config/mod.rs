use garde::Validate;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Deployment environment. Recovery only runs in production, since a local
/// process cannot see files uploaded to another environment's temp area.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    Production,
    #[default]
    Local,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    #[serde(default)]
    #[garde(skip)]
    pub app_env: AppEnv,

    /// PostgreSQL connection string. Without it the status store lives in
    /// process memory, which is only suitable for local runs.
    #[serde(default)]
    #[garde(skip)]
    pub database_url: Option<String>,

    /// Object storage bucket for imported media
    #[garde(length(min = 1))]
    pub s3_bucket: String,

    /// S3-compatible endpoint URL
    #[garde(length(min = 1))]
    pub s3_endpoint: String,

    #[garde(length(min = 1))]
    pub s3_access_key: String,

    #[garde(length(min = 1))]
    pub s3_secret_key: String,

    /// Directory uploads are staged in before import.
    #[serde(default = "default_upload_temp_dir")]
    #[garde(skip)]
    pub upload_temp_dir: PathBuf,

    /// Upper bound on processing a single item.
    #[serde(default = "default_item_timeout_secs")]
    #[garde(range(min = 1))]
    pub item_timeout_secs: u64,

    /// Age after which an unreferenced temp file is removed. Must exceed the
    /// item timeout.
    #[serde(default = "default_temp_retention_secs")]
    #[garde(custom(exceeds_item_timeout(&self.item_timeout_secs)))]
    pub temp_retention_secs: u64,

    #[serde(default = "default_temp_sweep_interval_secs")]
    #[garde(range(min = 1))]
    pub temp_sweep_interval_secs: u64,

    /// Extra attempts for transient transcoder/storage failures.
    #[serde(default = "default_transient_retry_limit")]
    #[garde(range(max = 10))]
    pub transient_retry_limit: u32,

    #[serde(default = "default_transient_retry_backoff_ms")]
    #[garde(skip)]
    pub transient_retry_backoff_ms: u64,

    /// Longest edge, in pixels, of each generated thumbnail.
    #[serde(default = "default_thumbnail_sizes")]
    #[garde(inner(range(min = 16, max = 4096)))]
    pub thumbnail_sizes: Vec<u32>,

    /// `source:target` extension pairs for alternate formats.
    #[serde(default = "default_alternate_formats")]
    #[garde(skip)]
    pub alternate_formats: Vec<String>,

    #[serde(default = "default_photo_extensions")]
    #[garde(length(min = 1))]
    pub photo_extensions: Vec<String>,

    #[serde(default = "default_video_extensions")]
    #[garde(length(min = 1))]
    pub video_extensions: Vec<String>,

    #[serde(default = "default_ffmpeg_path")]
    #[garde(skip)]
    pub ffmpeg_path: PathBuf,

    /// Request body limit for upload batches.
    #[serde(default = "default_max_upload_bytes")]
    #[garde(range(min = 1024))]
    pub max_upload_bytes: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_upload_temp_dir() -> PathBuf {
    std::env::temp_dir().join("media-import")
}

fn default_item_timeout_secs() -> u64 {
    600
}

fn default_temp_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_temp_sweep_interval_secs() -> u64 {
    60 * 60
}

fn default_transient_retry_limit() -> u32 {
    2
}

fn default_transient_retry_backoff_ms() -> u64 {
    500
}

fn default_thumbnail_sizes() -> Vec<u32> {
    vec![320, 1280]
}

fn default_alternate_formats() -> Vec<String> {
    ["heic:jpg", "heif:jpg", "tif:jpg", "tiff:jpg", "mov:mp4", "avi:mp4", "mkv:mp4"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_photo_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "tif", "tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_video_extensions() -> Vec<String> {
    ["mp4", "m4v", "webm", "mov", "avi", "mkv"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_max_upload_bytes() -> usize {
    512 * 1024 * 1024
}

fn exceeds_item_timeout(item_timeout_secs: &u64) -> impl FnOnce(&u64, &()) -> garde::Result + '_ {
    move |retention, _| {
        if retention <= item_timeout_secs {
            return Err(garde::Error::new(
                "temp retention must exceed the item timeout",
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn temp_retention(&self) -> Duration {
        Duration::from_secs(self.temp_retention_secs)
    }

    pub fn temp_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.temp_sweep_interval_secs)
    }

    pub fn transient_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.transient_retry_backoff_ms)
    }

    pub fn recovery_enabled(&self) -> bool {
        self.app_env == AppEnv::Production
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}
