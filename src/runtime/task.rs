use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Queue payload handed from the submit path to a worker slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub task_id: String,
    /// Job kind, resolved against the worker's [`crate::JobRegistry`].
    pub job: String,
    pub params: Value,
}
