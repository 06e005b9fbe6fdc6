use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::TrackerError;
use crate::jobs::JobRegistry;
use crate::runtime::Backends;
use crate::runtime::record::TaskRecord;
use crate::runtime::status::{CancelAck, StatusDocument};
use crate::runtime::task::Dispatch;

/// Submission, status and cancel surface over a set of [`Backends`].
///
/// The tracker never runs jobs itself; a [`crate::WorkerPool`] on the same
/// backends (in this process or another) picks up what it enqueues.
#[derive(Clone)]
pub struct TaskTracker {
    backends: Backends,
    jobs: Arc<JobRegistry>,
}

impl TaskTracker {
    pub fn new(backends: Backends, jobs: Arc<JobRegistry>) -> Self {
        Self { backends, jobs }
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    /// Creates a pending task and enqueues it, returning its id without
    /// waiting for the job. With a `dedup_key` already in the index, the id
    /// issued for that key is returned and nothing new is scheduled.
    pub async fn submit(
        &self,
        job: &str,
        params: Value,
        dedup_key: Option<&str>,
    ) -> Result<String, TrackerError> {
        let handler = self
            .jobs
            .get(job)
            .ok_or_else(|| TrackerError::InvalidInput(format!("Unknown job kind: {}", job)))?;
        handler
            .validate(&params)
            .map_err(|e| TrackerError::InvalidInput(e.to_string()))?;

        let task_id = Uuid::new_v4().to_string();
        let record = TaskRecord::new(task_id.clone(), job.to_string(), dedup_key.map(str::to_string));

        // The record exists before its id can be handed out through the index.
        self.backends.store.insert(record).await?;

        if let Some(key) = dedup_key {
            let reserved = self.backends.dedup.lookup_or_reserve(key, &task_id).await;
            let (existing, existed) = match reserved {
                Ok(pair) => pair,
                Err(e) => {
                    self.discard(&task_id).await;
                    return Err(e.into());
                }
            };
            if existed {
                self.discard(&task_id).await;
                info!(task_id = %existing, dedup_key = %key, "Duplicate submission collapsed");
                return Ok(existing);
            }
        }

        let pushed = self
            .backends
            .queue
            .push(Dispatch {
                task_id: task_id.clone(),
                job: job.to_string(),
                params,
            })
            .await;
        if let Err(e) = pushed {
            // Nothing will ever run this task, so neither it nor its key may outlive the error.
            self.discard(&task_id).await;
            if let Some(key) = dedup_key {
                if let Err(release_err) = self.backends.dedup.release(key, &task_id).await {
                    warn!(task_id = %task_id, dedup_key = %key, error = ?release_err, "Failed to release dedup key");
                }
            }
            return Err(e.into());
        }

        info!(task_id = %task_id, job = %job, "Task submitted");
        Ok(task_id)
    }

    pub async fn status(&self, task_id: &str) -> Result<StatusDocument, TrackerError> {
        let record = self
            .backends
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| TrackerError::not_found(task_id))?;
        Ok(StatusDocument::project(&record))
    }

    /// Requests cooperative cancellation. The task may still complete if its
    /// job does not reach a checkpoint in time.
    pub async fn cancel(&self, task_id: &str) -> Result<CancelAck, TrackerError> {
        // Revocation goes out first so a running job can see it as soon as
        // the record accepts the request.
        self.backends.cancellation.request(task_id).await?;

        let ack = match self.backends.store.request_cancel(task_id).await {
            Ok(Some(ack)) => ack,
            Ok(None) => {
                self.backends.cancellation.clear(task_id).await?;
                return Err(TrackerError::not_found(task_id));
            }
            Err(e) => {
                if let Err(clear_err) = self.backends.cancellation.clear(task_id).await {
                    warn!(task_id = %task_id, error = ?clear_err, "Failed to clear revocation");
                }
                return Err(e.into());
            }
        };

        if ack == CancelAck::AlreadyFinished {
            self.backends.cancellation.clear(task_id).await?;
        }
        info!(task_id = %task_id, ack = ?ack, "Cancel handled");
        Ok(ack)
    }

    /// Polls until the task is terminal and returns its final document.
    pub async fn wait(&self, task_id: &str, poll_interval: Duration) -> Result<StatusDocument, TrackerError> {
        loop {
            let status = self.status(task_id).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn discard(&self, task_id: &str) {
        if let Err(e) = self.backends.store.remove(task_id).await {
            warn!(task_id = %task_id, error = ?e, "Failed to discard task record");
        }
    }
}
