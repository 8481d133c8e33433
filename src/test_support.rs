// Test doubles for the external collaborators, shared by unit and
// integration tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::services::storage::{RemoteFileStore, StorageError};
use crate::services::transcoder::{TranscodeError, TranscodeRequest, Transcoder};

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Default)]
struct Script {
    permanent: HashSet<String>,
    transient: HashMap<String, u32>,
    hang: HashSet<String>,
    calls: Vec<String>,
}

/// Transcoder that writes placeholder bytes and fails on cue, keyed by the
/// source file name.
#[derive(Default)]
pub struct ScriptedTranscoder {
    script: Mutex<Script>,
}

impl ScriptedTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_permanently(&self, source_name: &str) {
        self.script.lock().unwrap().permanent.insert(source_name.to_string());
    }

    /// Fail the next `times` calls for this source with a transient error.
    pub fn fail_transiently(&self, source_name: &str, times: u32) {
        self.script
            .lock()
            .unwrap()
            .transient
            .insert(source_name.to_string(), times);
    }

    /// Never finish calls for this source.
    pub fn hang_on(&self, source_name: &str) {
        self.script.lock().unwrap().hang.insert(source_name.to_string());
    }

    pub fn clear(&self, source_name: &str) {
        let mut script = self.script.lock().unwrap();
        script.permanent.remove(source_name);
        script.transient.remove(source_name);
        script.hang.remove(source_name);
    }

    /// Source file names of every call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }
}

#[async_trait::async_trait]
impl Transcoder for ScriptedTranscoder {
    async fn transcode(&self, request: TranscodeRequest<'_>) -> Result<(), TranscodeError> {
        let name = file_name(request.source);
        let hang = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(name.clone());
            if script.permanent.contains(&name) {
                return Err(TranscodeError::Failed(format!("cannot decode {name}")));
            }
            if let Some(remaining) = script.transient.get_mut(&name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TranscodeError::Unavailable("transcoder busy".to_string()));
                }
            }
            script.hang.contains(&name)
        };

        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        tokio::fs::write(request.output, format!("derived from {name}")).await?;
        Ok(())
    }
}

#[derive(Default)]
struct Objects {
    objects: HashMap<String, Vec<u8>>,
    puts: Vec<String>,
    fail_matching: Option<String>,
}

/// Remote store keeping objects in memory.
#[derive(Default)]
pub struct MemoryRemoteStore {
    inner: Mutex<Objects>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every put whose key contains `fragment`.
    pub fn fail_puts_matching(&self, fragment: &str) {
        self.inner.lock().unwrap().fail_matching = Some(fragment.to_string());
    }

    pub fn stop_failing(&self) {
        self.inner.lock().unwrap().fail_matching = None;
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().unwrap().objects.contains_key(key)
    }

    /// Keys of every successful put, in order, including overwrites.
    pub fn puts(&self) -> Vec<String> {
        self.inner.lock().unwrap().puts.clone()
    }
}

#[async_trait::async_trait]
impl RemoteFileStore for MemoryRemoteStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<String, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(fragment) = &inner.fail_matching {
            if key.contains(fragment.as_str()) {
                return Err(StorageError::Status {
                    key: key.to_string(),
                    code: 503,
                });
            }
        }
        inner.objects.insert(key.to_string(), data.to_vec());
        inner.puts.push(key.to_string());
        Ok(key.to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.lock().unwrap().objects.remove(key);
        Ok(())
    }
}
