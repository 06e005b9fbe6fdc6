#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tasktrack::runtime::record::{Claim, Outcome, TaskRecord};
use tasktrack::runtime::storage::{JobQueue, TaskStore};
use tasktrack::runtime::task::Dispatch;
use tasktrack::{Backends, CancelAck, Job, JobContext, JobError, JobRegistry, StatusDocument, TaskTracker, WorkerPool};
use tokio::sync::watch;

pub fn setup(jobs: JobRegistry, capacity: usize) -> (TaskTracker, WorkerPool) {
    setup_with(Backends::in_memory(), jobs, capacity)
}

pub fn setup_with(backends: Backends, jobs: JobRegistry, capacity: usize) -> (TaskTracker, WorkerPool) {
    let jobs = Arc::new(jobs);
    let pool = WorkerPool::start(backends.clone(), jobs.clone(), capacity);
    (TaskTracker::new(backends, jobs), pool)
}

pub async fn wait_done(tracker: &TaskTracker, task_id: &str) -> StatusDocument {
    tokio::time::timeout(Duration::from_secs(5), tracker.wait(task_id, Duration::from_millis(5)))
        .await
        .expect("task did not reach a terminal state in time")
        .expect("status lookup failed")
}

/// Polls until the task has been picked up and reported progress.
pub async fn wait_running(tracker: &TaskTracker, task_id: &str) {
    for _ in 0..500 {
        let status = tracker.status(task_id).await.unwrap();
        if status.progress.unwrap_or(0) > 0 && !status.is_terminal() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {} never started", task_id);
}

/// Reports each value in `steps`, then returns `result`.
#[derive(Debug)]
pub struct ScriptedJob {
    pub name: &'static str,
    pub steps: Vec<u8>,
    pub delay: Duration,
    pub result: Value,
}

#[async_trait]
impl Job for ScriptedJob {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, _params: Value, ctx: &JobContext) -> Result<Value, JobError> {
        for progress in &self.steps {
            ctx.checkpoint().await?;
            tokio::time::sleep(self.delay).await;
            ctx.report_progress(*progress).await;
        }
        Ok(self.result.clone())
    }
}

#[derive(Debug)]
pub struct FailingJob;

#[async_trait]
impl Job for FailingJob {
    fn name(&self) -> &str {
        "failing"
    }

    async fn run(&self, _params: Value, ctx: &JobContext) -> Result<Value, JobError> {
        ctx.report_progress(50).await;
        Err(JobError::Failed("boom".to_string()))
    }
}

/// Reports 50, then fails with "boom" once the gate opens.
#[derive(Debug)]
pub struct GatedFailingJob {
    pub release: watch::Receiver<bool>,
}

#[async_trait]
impl Job for GatedFailingJob {
    fn name(&self) -> &str {
        "failing"
    }

    async fn run(&self, _params: Value, ctx: &JobContext) -> Result<Value, JobError> {
        ctx.report_progress(50).await;
        let mut release = self.release.clone();
        if release.wait_for(|open| *open).await.is_err() {
            return Err(JobError::Failed("gate dropped".to_string()));
        }
        Err(JobError::Failed("boom".to_string()))
    }
}

#[derive(Debug)]
pub struct CountingJob {
    pub name: &'static str,
    pub runs: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl CountingJob {
    pub fn new(name: &'static str, delay: Duration) -> (Self, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Self {
                name,
                runs: runs.clone(),
                delay,
            },
            runs,
        )
    }
}

#[async_trait]
impl Job for CountingJob {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, _params: Value, _ctx: &JobContext) -> Result<Value, JobError> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        Ok(json!(n))
    }
}

/// Long loop; with `checks` it reaches a checkpoint every iteration.
#[derive(Debug)]
pub struct LoopJob {
    pub name: &'static str,
    pub checks: bool,
    pub iterations: usize,
    pub done: Arc<AtomicUsize>,
}

#[async_trait]
impl Job for LoopJob {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, _params: Value, ctx: &JobContext) -> Result<Value, JobError> {
        for i in 0..self.iterations {
            if self.checks {
                ctx.checkpoint().await?;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.done.fetch_add(1, Ordering::SeqCst);
            ctx.report_progress(((i + 1) * 100 / self.iterations) as u8).await;
        }
        Ok(json!("finished"))
    }
}

/// Reports progress 1, then blocks until the gate opens.
#[derive(Debug)]
pub struct GateJob {
    pub release: watch::Receiver<bool>,
}

#[async_trait]
impl Job for GateJob {
    fn name(&self) -> &str {
        "gate"
    }

    async fn run(&self, _params: Value, ctx: &JobContext) -> Result<Value, JobError> {
        ctx.report_progress(1).await;
        let mut release = self.release.clone();
        if release.wait_for(|open| *open).await.is_err() {
            return Err(JobError::Failed("gate dropped".to_string()));
        }
        Ok(json!("released"))
    }
}

/// Appends `start:<label>` / `end:<label>` to a shared log.
#[derive(Debug)]
pub struct OrderJob {
    pub events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Job for OrderJob {
    fn name(&self) -> &str {
        "order"
    }

    async fn run(&self, params: Value, _ctx: &JobContext) -> Result<Value, JobError> {
        let label = params["label"].as_str().unwrap_or("?").to_string();
        self.events.lock().unwrap().push(format!("start:{}", label));
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.events.lock().unwrap().push(format!("end:{}", label));
        Ok(json!(label))
    }
}

/// Counts down failures; `true` while any are left.
fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Task store that fails the first `claim_failures` claims and, with
/// `cancel_fails`, every cancel request.
pub struct FaultyStore {
    pub inner: Arc<dyn TaskStore>,
    pub claim_failures: AtomicUsize,
    pub cancel_fails: bool,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn TaskStore>, claim_failures: usize, cancel_fails: bool) -> Self {
        Self {
            inner,
            claim_failures: AtomicUsize::new(claim_failures),
            cancel_fails,
        }
    }
}

#[async_trait]
impl TaskStore for FaultyStore {
    async fn insert(&self, record: TaskRecord) -> Result<()> {
        self.inner.insert(record).await
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        self.inner.remove(task_id).await
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.inner.get(task_id).await
    }

    async fn claim(&self, task_id: &str) -> Result<Claim> {
        if take_failure(&self.claim_failures) {
            return Err(anyhow!("transient"));
        }
        self.inner.claim(task_id).await
    }

    async fn report_progress(&self, task_id: &str, progress: u8) -> Result<bool> {
        self.inner.report_progress(task_id, progress).await
    }

    async fn finish(&self, task_id: &str, outcome: Outcome) -> Result<bool> {
        self.inner.finish(task_id, outcome).await
    }

    async fn request_cancel(&self, task_id: &str) -> Result<Option<CancelAck>> {
        if self.cancel_fails {
            return Err(anyhow!("store down"));
        }
        self.inner.request_cancel(task_id).await
    }
}

/// Queue whose first `push_failures` pushes fail.
pub struct FaultyQueue {
    pub inner: Arc<dyn JobQueue>,
    pub push_failures: AtomicUsize,
}

impl FaultyQueue {
    pub fn new(inner: Arc<dyn JobQueue>, push_failures: usize) -> Self {
        Self {
            inner,
            push_failures: AtomicUsize::new(push_failures),
        }
    }
}

#[async_trait]
impl JobQueue for FaultyQueue {
    async fn push(&self, dispatch: Dispatch) -> Result<()> {
        if take_failure(&self.push_failures) {
            return Err(anyhow!("queue down"));
        }
        self.inner.push(dispatch).await
    }

    async fn pop(&self) -> Result<Option<Dispatch>> {
        self.inner.pop().await
    }
}
