use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::JobError;
use crate::jobs::{Canceller, JobContext, JobRegistry, Reporter};
use crate::runtime::Backends;
use crate::runtime::record::{Claim, Outcome};
use crate::runtime::task::Dispatch;

/// Fixed number of worker slots pulling dispatches from the shared queue.
///
/// Each slot runs one job at a time, so at most `capacity` jobs execute
/// concurrently and queued dispatches start in FIFO order as slots free up.
/// Dropping the pool aborts its slots along with the jobs they are running.
pub struct WorkerPool {
    capacity: usize,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(backends: Backends, jobs: Arc<JobRegistry>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let handles = (0..capacity)
            .map(|slot| {
                let worker = Worker {
                    slot,
                    backends: backends.clone(),
                    jobs: jobs.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        info!(capacity, "Worker pool started");
        Self { capacity, handles }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits for the slots, which only return if they are aborted.
    pub async fn join(mut self) {
        for handle in std::mem::take(&mut self.handles) {
            let _ = handle.await;
        }
    }

    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Aborts the wrapped job when the owning slot is dropped mid-await.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

const CLAIM_RETRY_DELAY: Duration = Duration::from_millis(200);

struct Worker {
    slot: usize,
    backends: Backends,
    jobs: Arc<JobRegistry>,
}

impl Worker {
    async fn run(self) {
        loop {
            let dispatch = match self.backends.queue.pop().await {
                Ok(Some(dispatch)) => dispatch,
                Ok(None) => continue,
                Err(e) => {
                    error!(slot = self.slot, error = ?e, "Failed to pop dispatch");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            self.execute(dispatch).await;
        }
    }

    async fn execute(&self, dispatch: Dispatch) {
        let store = &self.backends.store;

        match store.claim(&dispatch.task_id).await {
            Ok(Claim::Run) => {}
            Ok(Claim::Skip(state)) => {
                info!(slot = self.slot, task_id = %dispatch.task_id, %state, "Dispatch skipped");
                self.clear_revocation(&dispatch.task_id).await;
                return;
            }
            Ok(Claim::Missing) => {
                warn!(slot = self.slot, task_id = %dispatch.task_id, "Dispatch for unknown task");
                return;
            }
            Err(e) => {
                error!(slot = self.slot, task_id = %dispatch.task_id, error = ?e, "Failed to claim task");
                self.requeue(dispatch).await;
                return;
            }
        }

        let Dispatch { task_id, job, params } = dispatch;

        let outcome = match self.jobs.get(&job) {
            Some(handler) => {
                let canceller = Canceller::new(task_id.clone(), self.backends.cancellation.clone());
                let ctx = JobContext::new(
                    task_id.clone(),
                    Reporter::new(task_id.clone(), store.clone()),
                    canceller.clone(),
                );
                info!(slot = self.slot, task_id = %task_id, job = %job, "Job started");

                // A panicking job fails its task instead of taking the slot down.
                let mut run = AbortOnDrop(tokio::spawn(async move { handler.run(params, &ctx).await }));
                match (&mut run.0).await {
                    Ok(Ok(_)) if canceller.observed() => Outcome::Canceled,
                    Ok(Ok(result)) => Outcome::Completed(result),
                    Ok(Err(JobError::Canceled)) => Outcome::Canceled,
                    Ok(Err(JobError::Failed(message))) => Outcome::Failed(message),
                    Err(e) => Outcome::Failed(format!("Job aborted: {}", e)),
                }
            }
            None => Outcome::Failed(format!("Unknown job kind: {}", job)),
        };

        let state = outcome.state();
        match store.finish(&task_id, outcome).await {
            Ok(true) => info!(slot = self.slot, task_id = %task_id, %state, "Task finished"),
            Ok(false) => warn!(slot = self.slot, task_id = %task_id, %state, "Task was already terminal"),
            Err(e) => error!(slot = self.slot, task_id = %task_id, error = ?e, "Failed to store outcome"),
        }
        self.clear_revocation(&task_id).await;
    }

    /// Puts an unclaimed dispatch back so the task is not stranded in PENDING.
    async fn requeue(&self, dispatch: Dispatch) {
        tokio::time::sleep(CLAIM_RETRY_DELAY).await;
        let task_id = dispatch.task_id.clone();
        let Err(e) = self.backends.queue.push(dispatch).await else {
            return;
        };
        error!(slot = self.slot, task_id = %task_id, error = ?e, "Failed to requeue dispatch");
        let outcome = Outcome::Failed(format!("Task could not be scheduled: {}", e));
        if let Err(e) = self.backends.store.finish(&task_id, outcome).await {
            error!(slot = self.slot, task_id = %task_id, error = ?e, "Failed to store outcome");
        }
    }

    async fn clear_revocation(&self, task_id: &str) {
        if let Err(e) = self.backends.cancellation.clear(task_id).await {
            warn!(slot = self.slot, task_id = %task_id, error = ?e, "Failed to clear revocation");
        }
    }
}
