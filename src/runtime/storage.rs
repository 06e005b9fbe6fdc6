use async_trait::async_trait;
use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};

use crate::runtime::record::{Claim, Outcome, TaskRecord};
use crate::runtime::status::CancelAck;
use crate::runtime::task::Dispatch;

// --- Interfaces ---

/// Owner of all task records.
///
/// Every mutating call applies one [`TaskRecord`] transition atomically with
/// respect to other calls on the same task id.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, record: TaskRecord) -> Result<()>;
    async fn remove(&self, task_id: &str) -> Result<()>;
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>>;
    async fn claim(&self, task_id: &str) -> Result<Claim>;
    /// Returns `false` if the task is unknown or already terminal.
    async fn report_progress(&self, task_id: &str, progress: u8) -> Result<bool>;
    /// Returns `false` if the task is unknown or already terminal.
    async fn finish(&self, task_id: &str, outcome: Outcome) -> Result<bool>;
    /// `None` when the task is unknown.
    async fn request_cancel(&self, task_id: &str) -> Result<Option<CancelAck>>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, dispatch: Dispatch) -> Result<()>;
    /// `Ok(None)` means nothing was available within the backend's wait window.
    async fn pop(&self) -> Result<Option<Dispatch>>;
}

// --- In-Memory Implementations ---

pub struct InMemoryJobQueue {
    sender: mpsc::UnboundedSender<Dispatch>,
    receiver: Mutex<mpsc::UnboundedReceiver<Dispatch>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: tx,
            receiver: Mutex::new(rx),
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn push(&self, dispatch: Dispatch) -> Result<()> {
        self.sender
            .send(dispatch)
            .map_err(|e| anyhow::anyhow!("Dispatch channel closed: {}", e))
    }

    async fn pop(&self) -> Result<Option<Dispatch>> {
        let mut rx = self.receiver.lock().await;
        Ok(rx.recv().await)
    }
}

/// Records keyed by task id. DashMap shards the map, and each transition runs
/// under the entry's write guard, so readers of other tasks are never blocked.
pub struct InMemoryTaskStore {
    records: DashMap<String, TaskRecord>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<()> {
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        self.records.remove(task_id);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.records.get(task_id).map(|r| r.value().clone()))
    }

    async fn claim(&self, task_id: &str) -> Result<Claim> {
        match self.records.get_mut(task_id) {
            Some(mut record) => Ok(record.claim()),
            None => Ok(Claim::Missing),
        }
    }

    async fn report_progress(&self, task_id: &str, progress: u8) -> Result<bool> {
        Ok(self
            .records
            .get_mut(task_id)
            .map(|mut record| record.apply_progress(progress))
            .unwrap_or(false))
    }

    async fn finish(&self, task_id: &str, outcome: Outcome) -> Result<bool> {
        Ok(self
            .records
            .get_mut(task_id)
            .map(|mut record| record.finish(outcome))
            .unwrap_or(false))
    }

    async fn request_cancel(&self, task_id: &str) -> Result<Option<CancelAck>> {
        Ok(self
            .records
            .get_mut(task_id)
            .map(|mut record| record.request_cancel()))
    }
}
