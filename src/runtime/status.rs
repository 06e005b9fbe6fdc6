use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::record::{TaskRecord, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusLabel {
    Pending,
    #[serde(rename = "In Progress")]
    InProgress,
    Failed,
    Canceled,
    Completed,
    Unknown,
}

/// Caller-facing view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub status: StatusLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
}

impl StatusDocument {
    pub fn project(record: &TaskRecord) -> Self {
        let blank = Self {
            status: StatusLabel::Unknown,
            progress: None,
            result: None,
            error: None,
            done: Some(record.state.is_terminal()),
        };
        match record.state {
            TaskState::Pending => Self {
                status: StatusLabel::Pending,
                progress: Some(0),
                ..blank
            },
            TaskState::Progress => Self {
                status: StatusLabel::InProgress,
                progress: Some(record.progress),
                ..blank
            },
            TaskState::Failed => Self {
                status: StatusLabel::Failed,
                error: Some(record.error.clone().unwrap_or_default()),
                ..blank
            },
            TaskState::Canceled => Self {
                status: StatusLabel::Canceled,
                ..blank
            },
            TaskState::Completed => Self {
                status: StatusLabel::Completed,
                progress: Some(100),
                result: Some(record.result.clone().unwrap_or(Value::Null)),
                ..blank
            },
        }
    }

    /// Document for an id the tracker has never issued.
    pub fn unknown() -> Self {
        Self {
            status: StatusLabel::Unknown,
            progress: None,
            result: None,
            error: None,
            done: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            StatusLabel::Completed | StatusLabel::Failed | StatusLabel::Canceled
        )
    }
}

/// Acknowledgment of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum CancelAck {
    #[serde(rename = "Cancel requested")]
    CancelRequested,
    #[serde(rename = "Task already finished or canceled")]
    AlreadyFinished,
}
