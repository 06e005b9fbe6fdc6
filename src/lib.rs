pub mod config;
pub mod error;
pub mod jobs;
pub mod runtime;

pub use error::{JobError, TrackerError};
pub use jobs::{Job, JobContext, JobRegistry};
pub use runtime::status::{CancelAck, StatusDocument};
pub use runtime::tracker::TaskTracker;
pub use runtime::pool::WorkerPool;
pub use runtime::Backends;
