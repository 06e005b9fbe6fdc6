use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::status::CancelAck;

/// Lifecycle state of a task.
///
/// `Completed`, `Failed` and `Canceled` are terminal: once a record reaches
/// one of them it is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Progress,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Progress => "PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROGRESS" => Ok(Self::Progress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(anyhow::anyhow!("Unknown task state: {}", other)),
        }
    }
}

/// How a run ended, as seen by the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Value),
    Failed(String),
    Canceled,
}

impl Outcome {
    pub fn state(&self) -> TaskState {
        match self {
            Self::Completed(_) => TaskState::Completed,
            Self::Failed(_) => TaskState::Failed,
            Self::Canceled => TaskState::Canceled,
        }
    }
}

/// Result of a worker trying to take ownership of a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The record was pending and unclaimed; the caller must run the job.
    Run,
    /// Terminal already (canceled while queued) or claimed by someone else.
    Skip(TaskState),
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub job: String,
    pub state: TaskState,
    pub progress: u8,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub dedup_key: Option<String>,
    pub cancel_requested: bool,
    pub started: bool,
}

impl TaskRecord {
    pub fn new(id: String, job: String, dedup_key: Option<String>) -> Self {
        Self {
            id,
            job,
            state: TaskState::Pending,
            progress: 0,
            result: None,
            error: None,
            dedup_key,
            cancel_requested: false,
            started: false,
        }
    }

    pub fn claim(&mut self) -> Claim {
        if self.state.is_terminal() || self.started {
            return Claim::Skip(self.state);
        }
        self.started = true;
        Claim::Run
    }

    /// Stores a progress report. Returns `false` when the record is terminal
    /// and the report was dropped.
    pub fn apply_progress(&mut self, progress: u8) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.progress = progress.min(100);
        if self.state == TaskState::Pending {
            self.state = TaskState::Progress;
        }
        true
    }

    /// Applies the single terminal transition. Returns `false` if the record
    /// was already terminal.
    pub fn finish(&mut self, outcome: Outcome) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = outcome.state();
        match outcome {
            Outcome::Completed(result) => {
                self.progress = 100;
                self.result = Some(result);
            }
            Outcome::Failed(message) => self.error = Some(message),
            Outcome::Canceled => {}
        }
        true
    }

    /// Marks the record as cancel-requested. A record that no worker has
    /// claimed yet goes straight to `Canceled`.
    pub fn request_cancel(&mut self) -> CancelAck {
        if self.state.is_terminal() {
            return CancelAck::AlreadyFinished;
        }
        self.cancel_requested = true;
        if !self.started {
            self.state = TaskState::Canceled;
        }
        CancelAck::CancelRequested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> TaskRecord {
        TaskRecord::new("t-1".to_string(), "stub".to_string(), None)
    }

    #[test]
    fn first_progress_moves_pending_to_progress() {
        let mut rec = record();
        assert!(rec.apply_progress(20));
        assert_eq!(rec.state, TaskState::Progress);
        assert_eq!(rec.progress, 20);

        // lower values are accepted as-is
        assert!(rec.apply_progress(10));
        assert_eq!(rec.progress, 10);
    }

    #[test]
    fn progress_is_clamped() {
        let mut rec = record();
        rec.apply_progress(250);
        assert_eq!(rec.progress, 100);
    }

    #[test]
    fn only_one_terminal_transition() {
        let mut rec = record();
        assert_eq!(rec.claim(), Claim::Run);
        assert!(rec.finish(Outcome::Completed(json!("ok"))));
        assert!(!rec.finish(Outcome::Failed("late".to_string())));
        assert!(!rec.apply_progress(5));

        assert_eq!(rec.state, TaskState::Completed);
        assert_eq!(rec.progress, 100);
        assert_eq!(rec.result, Some(json!("ok")));
        assert_eq!(rec.error, None);
    }

    #[test]
    fn cancel_before_claim_is_immediate() {
        let mut rec = record();
        assert_eq!(rec.request_cancel(), CancelAck::CancelRequested);
        assert_eq!(rec.state, TaskState::Canceled);
        assert_eq!(rec.claim(), Claim::Skip(TaskState::Canceled));
    }

    #[test]
    fn cancel_after_claim_only_sets_flag() {
        let mut rec = record();
        rec.claim();
        assert_eq!(rec.request_cancel(), CancelAck::CancelRequested);
        assert_eq!(rec.state, TaskState::Pending);
        assert!(rec.cancel_requested);

        // a job that never checks still completes
        assert!(rec.finish(Outcome::Completed(json!(1))));
        assert_eq!(rec.request_cancel(), CancelAck::AlreadyFinished);
        assert!(rec.cancel_requested);
    }

    #[test]
    fn second_claim_is_skipped() {
        let mut rec = record();
        assert_eq!(rec.claim(), Claim::Run);
        assert_eq!(rec.claim(), Claim::Skip(TaskState::Pending));
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            TaskState::Pending,
            TaskState::Progress,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Canceled,
        ] {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert!("RUNNING".parse::<TaskState>().is_err());
    }
}
