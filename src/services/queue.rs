use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::task::ImportTask;
use crate::services::store::{StatusStore, StoreError};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Uuid>,
    /// Ids currently in `pending`.
    queued: HashSet<Uuid>,
    in_flight: Option<Uuid>,
    /// The in-flight task was resumed while being worked; queue it again on
    /// `finish`.
    requeue_in_flight: bool,
    stopped: bool,
}

/// In-process FIFO of import task ids with a single consumer.
///
/// Tasks are persisted before they become visible to [`TaskQueue::dequeue`],
/// so anything accepted here survives a crash and is picked up again by
/// recovery.
pub struct TaskQueue {
    store: Arc<dyn StatusStore>,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self {
            store,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Persist a new task as `Queued` and enqueue it.
    ///
    /// Fails with [`QueueError::Conflict`] when the game already has an
    /// active task; the task is then neither stored nor queued.
    pub async fn submit(&self, task: &ImportTask) -> Result<(), QueueError> {
        if self.state.lock().await.stopped {
            return Err(QueueError::Stopped);
        }
        self.store.create_task(task).await?;
        self.push(task.id).await?;

        metrics::counter!("media_import_tasks_submitted").increment(1);
        tracing::info!(
            task_id = %task.id,
            game_id = ?task.game_id,
            items = task.items.len(),
            "Import task queued"
        );
        Ok(())
    }

    /// Re-enqueue an already persisted task without the per-game conflict
    /// check. A task that is currently being worked is queued again once the
    /// worker finishes with it. Returns `false` if the task is already
    /// scheduled either way.
    pub async fn resume(&self, task_id: Uuid) -> Result<bool, QueueError> {
        let pushed = self.push(task_id).await?;
        if pushed {
            tracing::info!(task_id = %task_id, "Import task resumed");
        } else {
            tracing::debug!(task_id = %task_id, "Import task already queued");
        }
        Ok(pushed)
    }

    async fn push(&self, task_id: Uuid) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(QueueError::Stopped);
        }
        if state.in_flight == Some(task_id) {
            let first = !state.requeue_in_flight;
            state.requeue_in_flight = true;
            return Ok(first);
        }
        if !state.queued.insert(task_id) {
            return Ok(false);
        }
        state.pending.push_back(task_id);
        metrics::gauge!("media_import_queue_depth").set(state.pending.len() as f64);
        drop(state);

        self.notify.notify_one();
        Ok(true)
    }

    /// Wait for the next task id. Returns `None` once the queue is stopped
    /// or `shutdown` fires.
    pub async fn dequeue(&self, shutdown: &CancellationToken) -> Option<Uuid> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.stopped {
                    return None;
                }
                if let Some(task_id) = state.pending.pop_front() {
                    state.queued.remove(&task_id);
                    state.in_flight = Some(task_id);
                    state.requeue_in_flight = false;
                    metrics::gauge!("media_import_queue_depth").set(state.pending.len() as f64);
                    return Some(task_id);
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Acknowledge that the consumer is done with `task_id`.
    pub async fn finish(&self, task_id: Uuid) {
        let mut state = self.state.lock().await;
        if state.in_flight != Some(task_id) {
            return;
        }
        state.in_flight = None;
        if !std::mem::take(&mut state.requeue_in_flight) || state.stopped {
            return;
        }
        if state.queued.insert(task_id) {
            state.pending.push_back(task_id);
            metrics::gauge!("media_import_queue_depth").set(state.pending.len() as f64);
        }
        drop(state);

        tracing::debug!(task_id = %task_id, "Requeued task resumed while in flight");
        self.notify.notify_one();
    }

    /// Stop accepting work and wake any waiting consumer.
    pub async fn stop(&self) {
        self.state.lock().await.stopped = true;
        self.notify.notify_waiters();
    }

    /// Number of tasks waiting to be dequeued.
    pub async fn depth(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Game {0} already has an active import task")]
    Conflict(Uuid),

    #[error("Task queue is stopped")]
    Stopped,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(game_id) => QueueError::Conflict(game_id),
            other => QueueError::Store(other),
        }
    }
}
