use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::error::JobError;
use crate::runtime::cancel::CancellationBackend;
use crate::runtime::storage::TaskStore;

/// Progress capability bound to one task.
#[derive(Clone)]
pub struct Reporter {
    task_id: String,
    store: Arc<dyn TaskStore>,
}

impl Reporter {
    pub fn new(task_id: String, store: Arc<dyn TaskStore>) -> Self {
        Self { task_id, store }
    }

    /// Records `progress` (clamped to 100). Reports arriving after the task
    /// became terminal are dropped.
    pub async fn report(&self, progress: u8) {
        match self.store.report_progress(&self.task_id, progress.min(100)).await {
            Ok(true) => {}
            Ok(false) => debug!(task_id = %self.task_id, progress, "Progress report dropped"),
            Err(e) => warn!(task_id = %self.task_id, error = ?e, "Failed to store progress"),
        }
    }
}

/// Cancellation-check capability bound to one task.
///
/// The first observed revocation is latched and the shared marker cleared;
/// every later check keeps failing with [`JobError::Canceled`].
#[derive(Clone)]
pub struct Canceller {
    task_id: String,
    backend: Arc<dyn CancellationBackend>,
    observed: Arc<AtomicBool>,
}

impl Canceller {
    pub fn new(task_id: String, backend: Arc<dyn CancellationBackend>) -> Self {
        Self {
            task_id,
            backend,
            observed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn check(&self) -> Result<(), JobError> {
        if self.observed() {
            return Err(JobError::Canceled);
        }
        match self.backend.is_requested(&self.task_id).await {
            Ok(true) => {
                self.observed.store(true, Ordering::SeqCst);
                if let Err(e) = self.backend.clear(&self.task_id).await {
                    warn!(task_id = %self.task_id, error = ?e, "Failed to clear revocation");
                }
                debug!(task_id = %self.task_id, "Cancellation observed");
                Err(JobError::Canceled)
            }
            Ok(false) => Ok(()),
            Err(e) => {
                // An unreachable backend must not fail the job.
                warn!(task_id = %self.task_id, error = ?e, "Cancellation check failed");
                Ok(())
            }
        }
    }

    pub fn observed(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }
}

/// What a job body receives alongside its params.
#[derive(Clone)]
pub struct JobContext {
    task_id: String,
    reporter: Reporter,
    canceller: Canceller,
}

impl JobContext {
    pub fn new(task_id: String, reporter: Reporter, canceller: Canceller) -> Self {
        Self {
            task_id,
            reporter,
            canceller,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn report_progress(&self, progress: u8) {
        self.reporter.report(progress).await
    }

    /// Cooperative cancellation point. Long loops should call this on every
    /// iteration and propagate the error with `?`.
    pub async fn checkpoint(&self) -> Result<(), JobError> {
        self.canceller.check().await
    }
}
