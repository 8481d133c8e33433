use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::models::media::{asset_identifier, FilePurpose, MediaResource, RemoteFile};
use crate::models::task::{ImportItem, ImportTask};
use crate::services::formats::{FormatError, FormatPolicy, PlannedOutput};
use crate::services::storage::{storage_key, RemoteFileStore, StorageError};
use crate::services::transcoder::{TranscodeError, TranscodeRequest, Transcoder};

/// Bounded retry for transient collaborator failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for TranscodeError {
    fn is_transient(&self) -> bool {
        TranscodeError::is_transient(self)
    }
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }
}

impl Transient for std::io::Error {
    fn is_transient(&self) -> bool {
        self.kind() != std::io::ErrorKind::NotFound
    }
}

/// Per-item transformation: classify, transcode, upload, describe.
///
/// The pipeline never touches the status store; the worker persists the
/// returned [`MediaResource`].
pub struct ImportPipeline {
    transcoder: Arc<dyn Transcoder>,
    remote: Arc<dyn RemoteFileStore>,
    policy: Arc<FormatPolicy>,
    retry: RetryPolicy,
    item_timeout: Duration,
    scratch_root: PathBuf,
}

impl ImportPipeline {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        remote: Arc<dyn RemoteFileStore>,
        policy: Arc<FormatPolicy>,
        scratch_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transcoder,
            remote,
            policy,
            retry: RetryPolicy::default(),
            item_timeout: Duration::from_secs(600),
            scratch_root: scratch_root.into(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_item_timeout(mut self, item_timeout: Duration) -> Self {
        self.item_timeout = item_timeout;
        self
    }

    /// Import one item end to end.
    ///
    /// On success every planned file is in remote storage and described by
    /// the returned resource. On failure nothing is left behind remotely.
    /// Scratch space is always reclaimed; temp sources are released on
    /// success and on permanent failure, and kept for a restart otherwise.
    pub async fn run_item(
        &self,
        task: &ImportTask,
        item: &ImportItem,
        existing: Option<&MediaResource>,
    ) -> Result<MediaResource, PipelineError> {
        let asset = asset_identifier(task.game_id, task.id, &item.base_name);
        let attempt = Uuid::new_v4();
        let scratch = self.scratch_root.join(attempt.to_string());
        let mut uploaded = Vec::new();

        let outcome = match timeout(
            self.item_timeout,
            self.produce(task, item, existing, attempt, &scratch, &mut uploaded),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::TimedOut(self.item_timeout)),
        };

        if outcome.is_err() {
            self.discard_uploads(&uploaded).await;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %scratch.display(), error = %e, "Failed to remove scratch directory");
            }
        }

        // Sources of retryable failures stay for a restart; TempCleaner
        // removes them once the retention window passes.
        let release = match &outcome {
            Ok(_) => true,
            Err(e) => e.is_permanent(),
        };
        if release {
            release_sources(item).await;
        }

        outcome
    }

    async fn produce(
        &self,
        task: &ImportTask,
        item: &ImportItem,
        existing: Option<&MediaResource>,
        attempt: Uuid,
        scratch: &std::path::Path,
        uploaded: &mut Vec<String>,
    ) -> Result<MediaResource, PipelineError> {
        let asset = asset_identifier(task.game_id, task.id, &item.base_name);
        let override_alternates = item.alternate_format_override
            || existing.map(|r| r.alternate_format_override).unwrap_or(false);

        let plan = self.policy.plan(item, override_alternates)?;
        for output in plan.iter().filter(|o| o.purpose == FilePurpose::Original) {
            if !tokio::fs::try_exists(&output.source).await.unwrap_or(false) {
                return Err(PipelineError::Malformed(format!(
                    "source file {} is missing",
                    output.source.display()
                )));
            }
        }

        // ── Produce every derivative before uploading anything ─────────
        tokio::fs::create_dir_all(scratch).await?;
        let mut produced: Vec<(&PlannedOutput, PathBuf)> = Vec::with_capacity(plan.len());
        for output in &plan {
            let path = match output.purpose {
                FilePurpose::Original => output.source.clone(),
                _ => {
                    let path = scratch.join(format!("{}.{}", output.file_stem(), output.extension));
                    let request = TranscodeRequest {
                        source: &output.source,
                        output: &path,
                        max_dimension: output.max_dimension,
                    };
                    self.retrying("transcode", || self.transcoder.transcode(request))
                        .await?;
                    path
                }
            };
            produced.push((output, path));
        }

        // ── Upload ─────────────────────────────────────────────────────
        let mut files = Vec::with_capacity(produced.len());
        for (output, path) in produced {
            let data = self.retrying("read", || tokio::fs::read(&path)).await?;
            let key = storage_key(asset, attempt, &output.file_stem(), &output.extension);
            let content_type = mime_guess::from_ext(&output.extension)
                .first_or_octet_stream()
                .essence_str()
                .to_string();

            let stored_key = self
                .retrying("upload", || self.remote.put(&key, &data, &content_type))
                .await?;
            uploaded.push(stored_key.clone());

            files.push(RemoteFile {
                purpose: output.purpose,
                name_modifier: output.name_modifier.clone(),
                extension: output.extension.clone(),
                content_type,
                storage_key: stored_key,
            });
        }

        tracing::debug!(
            task_id = %task.id,
            item_id = %item.id,
            asset = %asset,
            files = files.len(),
            "Item files stored"
        );

        Ok(MediaResource {
            asset_identifier: asset,
            game_id: task.game_id,
            resource_type: item.resource_type,
            favorite: existing.map(|r| r.favorite).unwrap_or(false),
            alternate_format_override: override_alternates,
            files,
        })
    }

    async fn retrying<T, E, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::fmt::Display,
    {
        let mut tries = 0u32;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && tries < self.retry.retries => {
                    tries += 1;
                    tracing::warn!(operation, attempt = tries, error = %e, "Transient failure, retrying");
                    sleep(self.retry.backoff * tries).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delete objects of `previous` whose slot `saved` now fills with a
    /// different key. Call only after `saved` is committed.
    pub async fn prune_superseded(&self, previous: Option<&MediaResource>, saved: &MediaResource) {
        let Some(previous) = previous else { return };
        let stale: Vec<String> = previous
            .files
            .iter()
            .filter(|old| {
                saved
                    .files
                    .iter()
                    .any(|new| new.slot() == old.slot() && new.storage_key != old.storage_key)
            })
            .map(|old| old.storage_key.clone())
            .collect();
        self.discard_uploads(&stale).await;
    }

    async fn discard_uploads(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.remote.delete(key).await {
                tracing::warn!(key = %key, error = %e, "Failed to delete stored object");
            }
        }
    }
}

/// Delete an item's temp source files, ignoring ones already gone.
pub async fn release_sources(item: &ImportItem) {
    for path in item.source_paths() {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(item_id = %item.id, path = %path.display(), error = %e, "Failed to release temp source");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    Malformed(String),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

impl From<FormatError> for PipelineError {
    fn from(e: FormatError) -> Self {
        PipelineError::Malformed(e.to_string())
    }
}

impl PipelineError {
    /// Failures a restart cannot fix.
    pub fn is_permanent(&self) -> bool {
        match self {
            PipelineError::Malformed(_) => true,
            PipelineError::Transcode(e) => !e.is_transient(),
            PipelineError::Storage(e) => !e.is_transient(),
            PipelineError::Io(e) => !Transient::is_transient(e),
            PipelineError::TimedOut(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::ResourceType;
    use crate::test_support::{MemoryRemoteStore, ScriptedTranscoder};

    struct Fixture {
        dir: tempfile::TempDir,
        remote: Arc<MemoryRemoteStore>,
        transcoder: Arc<ScriptedTranscoder>,
        pipeline: ImportPipeline,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemoteStore::new());
        let transcoder = Arc::new(ScriptedTranscoder::new());
        let policy = FormatPolicy::new(["jpg", "heic"], ["mp4", "mov"])
            .with_alternate("heic", "jpg")
            .with_alternate("mov", "mp4")
            .with_thumbnail_sizes(vec![320]);
        let pipeline = ImportPipeline::new(
            transcoder.clone(),
            remote.clone(),
            Arc::new(policy),
            dir.path().join("scratch"),
        )
        .with_retry(RetryPolicy {
            retries: 2,
            backoff: Duration::from_millis(1),
        });
        Fixture {
            dir,
            remote,
            transcoder,
            pipeline,
        }
    }

    fn source(fx: &Fixture, name: &str) -> PathBuf {
        let path = fx.dir.path().join(name);
        std::fs::write(&path, name.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_jpeg_photo_stores_original_and_thumbnail() {
        let fx = fixture();
        let path = source(&fx, "IMG_1.jpg");
        let item = ImportItem::new(0, "IMG_1", ResourceType::Photo).with_photo(&path, "IMG_1.jpg");
        let task = ImportTask::new(Some(uuid::Uuid::new_v4()), vec![item.clone()]);

        let resource = fx.pipeline.run_item(&task, &item, None).await.unwrap();

        let originals: Vec<_> = resource.files.iter().filter(|f| f.purpose == FilePurpose::Original).collect();
        assert_eq!(originals.len(), 1);
        assert_eq!(originals[0].content_type, "image/jpeg");
        assert!(resource.files.iter().all(|f| f.purpose != FilePurpose::AlternateFormat));
        assert_eq!(fx.remote.object_count(), resource.files.len());
        assert!(!path.exists(), "temp source should be released");
    }

    #[tokio::test]
    async fn test_permanent_transcode_failure_leaves_nothing_behind() {
        let fx = fixture();
        let path = source(&fx, "IMG_2.heic");
        fx.transcoder.fail_permanently("IMG_2.heic");
        let item = ImportItem::new(0, "IMG_2", ResourceType::Photo).with_photo(&path, "IMG_2.heic");
        let task = ImportTask::new(Some(uuid::Uuid::new_v4()), vec![item.clone()]);

        let err = fx.pipeline.run_item(&task, &item, None).await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(fx.remote.object_count(), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fx = fixture();
        let path = source(&fx, "clip.mov");
        fx.transcoder.fail_transiently("clip.mov", 2);
        let item = ImportItem::new(0, "clip", ResourceType::Video).with_video(&path, "clip.mov");
        let task = ImportTask::new(Some(uuid::Uuid::new_v4()), vec![item.clone()]);

        let resource = fx.pipeline.run_item(&task, &item, None).await.unwrap();
        assert!(resource
            .files
            .iter()
            .any(|f| f.purpose == FilePurpose::AlternateFormat && f.extension == "mp4"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_sources_for_restart() {
        let fx = fixture();
        let path = source(&fx, "clip2.mov");
        fx.transcoder.fail_transiently("clip2.mov", 10);
        let item = ImportItem::new(0, "clip2", ResourceType::Video).with_video(&path, "clip2.mov");
        let task = ImportTask::new(Some(uuid::Uuid::new_v4()), vec![item.clone()]);

        let err = fx.pipeline.run_item(&task, &item, None).await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_upload_failure_rolls_back_earlier_uploads() {
        let fx = fixture();
        let path = source(&fx, "IMG_3.jpg");
        fx.remote.fail_puts_matching("thumb");
        let item = ImportItem::new(0, "IMG_3", ResourceType::Photo).with_photo(&path, "IMG_3.jpg");
        let task = ImportTask::new(Some(uuid::Uuid::new_v4()), vec![item.clone()]);

        assert!(fx.pipeline.run_item(&task, &item, None).await.is_err());
        assert_eq!(fx.remote.object_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_item_times_out() {
        let fx = fixture();
        let path = source(&fx, "slow.mov");
        fx.transcoder.hang_on("slow.mov");
        let pipeline = fx.pipeline.with_item_timeout(Duration::from_millis(50));
        let item = ImportItem::new(0, "slow", ResourceType::Video).with_video(&path, "slow.mov");
        let task = ImportTask::new(Some(uuid::Uuid::new_v4()), vec![item.clone()]);

        let err = pipeline.run_item(&task, &item, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::TimedOut(_)));
        assert_eq!(fx.remote.object_count(), 0);
    }

    #[tokio::test]
    async fn test_existing_override_and_favorite_are_preserved() {
        let fx = fixture();
        let path = source(&fx, "IMG_4.heic");
        let item = ImportItem::new(0, "IMG_4", ResourceType::Photo).with_photo(&path, "IMG_4.heic");
        let task = ImportTask::new(Some(uuid::Uuid::new_v4()), vec![item.clone()]);
        let existing = MediaResource {
            asset_identifier: asset_identifier(task.game_id, task.id, "IMG_4"),
            game_id: task.game_id,
            resource_type: ResourceType::Photo,
            favorite: true,
            alternate_format_override: true,
            files: Vec::new(),
        };

        let resource = fx.pipeline.run_item(&task, &item, Some(&existing)).await.unwrap();
        assert!(resource.favorite);
        assert!(resource.files.iter().all(|f| f.purpose != FilePurpose::AlternateFormat));
    }
    #[tokio::test]
    async fn test_failed_reimport_keeps_committed_objects() {
        let fx = fixture();
        let game = Some(uuid::Uuid::new_v4());
        let first_path = source(&fx, "IMG_5.jpg");
        let item = ImportItem::new(0, "IMG_5", ResourceType::Photo).with_photo(&first_path, "IMG_5.jpg");
        let task = ImportTask::new(game, vec![item.clone()]);
        let committed = fx.pipeline.run_item(&task, &item, None).await.unwrap();

        let again_path = source(&fx, "IMG_5.jpg");
        let again = ImportItem::new(0, "IMG_5", ResourceType::Photo).with_photo(&again_path, "IMG_5.jpg");
        let second = ImportTask::new(game, vec![again.clone()]);
        fx.remote.fail_puts_matching("thumb");

        assert!(fx.pipeline.run_item(&second, &again, Some(&committed)).await.is_err());
        for file in &committed.files {
            assert!(fx.remote.contains(&file.storage_key), "{} was rolled back", file.storage_key);
        }
        assert_eq!(fx.remote.object_count(), committed.files.len());
    }

    #[tokio::test]
    async fn test_prune_removes_only_replaced_objects() {
        let fx = fixture();
        let game = Some(uuid::Uuid::new_v4());
        let path = source(&fx, "IMG_6.heic");
        let item = ImportItem::new(0, "IMG_6", ResourceType::Photo).with_photo(&path, "IMG_6.heic");
        let task = ImportTask::new(game, vec![item.clone()]);
        let first = fx.pipeline.run_item(&task, &item, None).await.unwrap();

        // Re-import with alternates overridden: the alternate slot is not
        // rewritten and must survive.
        let path = source(&fx, "IMG_6.heic");
        let again = ImportItem::new(0, "IMG_6", ResourceType::Photo)
            .with_photo(&path, "IMG_6.heic")
            .with_alternate_format_override(true);
        let second = ImportTask::new(game, vec![again.clone()]);
        let replaced = fx.pipeline.run_item(&second, &again, Some(&first)).await.unwrap();
        fx.pipeline.prune_superseded(Some(&first), &replaced).await;

        for file in &first.files {
            let kept = fx.remote.contains(&file.storage_key);
            assert_eq!(kept, file.purpose == FilePurpose::AlternateFormat, "{}", file.storage_key);
        }
        for file in &replaced.files {
            assert!(fx.remote.contains(&file.storage_key));
        }
    }
}
