use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

use crate::services::store::{StatusStore, StoreError};

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    /// Old enough to delete but still referenced by an active item.
    pub retained: usize,
}

/// Periodic sweep of orphaned upload temp files.
///
/// Items release their own sources; this only catches what a crash or a
/// failed restart left behind.
pub struct TempCleaner {
    store: Arc<dyn StatusStore>,
    root: PathBuf,
    retention: Duration,
    interval: Duration,
}

fn is_expired(modified: std::io::Result<SystemTime>, now: SystemTime, retention: Duration) -> bool {
    match modified {
        Ok(at) => now.duration_since(at).unwrap_or_default() >= retention,
        Err(_) => false,
    }
}

impl TempCleaner {
    pub fn new(
        store: Arc<dyn StatusStore>,
        root: impl Into<PathBuf>,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            root: root.into(),
            retention,
            interval,
        }
    }

    /// Sweep on a fixed interval until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.sweep().await {
                Ok(report) if report.deleted > 0 => {
                    tracing::info!(
                        scanned = report.scanned,
                        deleted = report.deleted,
                        retained = report.retained,
                        "Temp sweep removed orphaned uploads"
                    );
                }
                Ok(report) => tracing::debug!(scanned = report.scanned, "Temp sweep found nothing to remove"),
                Err(e) => tracing::error!(error = %e, "Temp sweep failed"),
            }
        }
    }

    /// Delete expired files that no active item references, then any
    /// expired directories left empty.
    pub async fn sweep(&self) -> Result<SweepReport, SweepError> {
        let mut report = SweepReport::default();
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(report);
        }

        let referenced = self.store.referenced_temp_paths().await?;
        let now = SystemTime::now();
        let mut pending = vec![self.root.clone()];
        let mut directories = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable temp entry");
                        continue;
                    }
                };

                if metadata.is_dir() {
                    pending.push(path.clone());
                    directories.push((path, metadata.modified()));
                    continue;
                }

                report.scanned += 1;
                if !is_expired(metadata.modified(), now, self.retention) {
                    continue;
                }
                if referenced.contains(&path) {
                    report.retained += 1;
                    continue;
                }
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to delete temp file"),
                }
            }
        }

        // Deepest first so parents can empty out.
        directories.sort_by_key(|(p, _)| std::cmp::Reverse(p.components().count()));
        for (dir, modified) in directories {
            if is_expired(modified, now, self.retention) {
                // Fails harmlessly when the directory still has files.
                let _ = tokio::fs::remove_dir(&dir).await;
            }
        }

        metrics::counter!("media_import_temp_files_deleted").increment(report.deleted as u64);
        Ok(report)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
