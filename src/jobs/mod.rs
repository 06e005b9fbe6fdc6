use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::error::JobError;

pub mod builtin;
pub mod context;
pub mod polling;

pub use context::{Canceller, JobContext, Reporter};

/// A kind of work the tracker can run.
///
/// Bodies report progress and call [`JobContext::checkpoint`] between units
/// of work; returning [`JobError::Canceled`] (usually via `?` on a checkpoint)
/// ends the task as canceled, any other error ends it as failed.
#[async_trait]
pub trait Job: Send + Sync + Debug {
    fn name(&self) -> &str;
    /// Rejects params at submission time, before a task is created.
    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }
    async fn run(&self, params: Value, ctx: &JobContext) -> Result<Value, JobError>;
}

/// Job kinds by name, built once at startup.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job: Arc<dyn Job>) {
        self.jobs.insert(job.name().to_string(), job);
    }

    pub fn with(mut self, job: Arc<dyn Job>) -> Self {
        self.register(job);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}
