pub mod cancel;
pub mod dedup;
pub mod pool;
pub mod record;
pub mod redis_storage;
pub mod status;
pub mod storage;
pub mod task;
pub mod tracker;

use std::sync::Arc;

use crate::runtime::cancel::{CancellationBackend, LocalCancellation};
use crate::runtime::dedup::{DedupIndex, InMemoryDedupIndex};
use crate::runtime::storage::{InMemoryJobQueue, InMemoryTaskStore, JobQueue, TaskStore};

/// The storage seams shared by the tracker and its worker pools.
///
/// Cloning is cheap; every clone points at the same backends.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn TaskStore>,
    pub queue: Arc<dyn JobQueue>,
    pub cancellation: Arc<dyn CancellationBackend>,
    pub dedup: Arc<dyn DedupIndex>,
}

impl Backends {
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryTaskStore::new()),
            queue: Arc::new(InMemoryJobQueue::new()),
            cancellation: Arc::new(LocalCancellation::new()),
            dedup: Arc::new(InMemoryDedupIndex::new()),
        }
    }
}
