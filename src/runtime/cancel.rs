use async_trait::async_trait;
use anyhow::Result;
use dashmap::DashMap;

/// Revocation state keyed by task id.
///
/// Each running job gets its own [`crate::jobs::Canceller`], which is the only
/// reader of the revocation for that task. It clears the marker after
/// observing it and latches the result locally, so clear-on-read never hides
/// a revocation from the job that owns it.
#[async_trait]
pub trait CancellationBackend: Send + Sync {
    async fn request(&self, task_id: &str) -> Result<()>;
    async fn is_requested(&self, task_id: &str) -> Result<bool>;
    async fn clear(&self, task_id: &str) -> Result<()>;
}

/// Process-local flags. Only visible to workers in the same process.
#[derive(Default)]
pub struct LocalCancellation {
    flags: DashMap<String, bool>,
}

impl LocalCancellation {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CancellationBackend for LocalCancellation {
    async fn request(&self, task_id: &str) -> Result<()> {
        self.flags.insert(task_id.to_string(), true);
        Ok(())
    }

    async fn is_requested(&self, task_id: &str) -> Result<bool> {
        Ok(self.flags.get(task_id).map(|f| *f.value()).unwrap_or(false))
    }

    async fn clear(&self, task_id: &str) -> Result<()> {
        self.flags.remove(task_id);
        Ok(())
    }
}
