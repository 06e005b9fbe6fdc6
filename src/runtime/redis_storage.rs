use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use anyhow::{Result, anyhow};
use redis::{AsyncCommands, Script};

use crate::runtime::Backends;
use crate::runtime::cancel::CancellationBackend;
use crate::runtime::dedup::DedupIndex;
use crate::runtime::record::{Claim, Outcome, TaskRecord, TaskState};
use crate::runtime::status::CancelAck;
use crate::runtime::storage::{JobQueue, TaskStore};
use crate::runtime::task::Dispatch;

// Every script treats these three states as final.
const CLAIM_SCRIPT: &str = r#"
    local state = redis.call("HGET", KEYS[1], "state")
    if not state then
        return "MISSING"
    end
    if state == "COMPLETED" or state == "FAILED" or state == "CANCELED" then
        return state
    end
    if redis.call("HGET", KEYS[1], "started") == "1" then
        return state
    end
    redis.call("HSET", KEYS[1], "started", "1")
    return "RUN"
"#;

const PROGRESS_SCRIPT: &str = r#"
    local state = redis.call("HGET", KEYS[1], "state")
    if not state or state == "COMPLETED" or state == "FAILED" or state == "CANCELED" then
        return 0
    end
    redis.call("HSET", KEYS[1], "progress", ARGV[1])
    if state == "PENDING" then
        redis.call("HSET", KEYS[1], "state", "PROGRESS")
    end
    return 1
"#;

// ARGV[1] = target state, ARGV[2] = result JSON or error message
const FINISH_SCRIPT: &str = r#"
    local state = redis.call("HGET", KEYS[1], "state")
    if not state or state == "COMPLETED" or state == "FAILED" or state == "CANCELED" then
        return 0
    end
    redis.call("HSET", KEYS[1], "state", ARGV[1])
    if ARGV[1] == "COMPLETED" then
        redis.call("HSET", KEYS[1], "progress", "100", "result", ARGV[2])
    elseif ARGV[1] == "FAILED" then
        redis.call("HSET", KEYS[1], "error", ARGV[2])
    end
    return 1
"#;

const CANCEL_SCRIPT: &str = r#"
    local state = redis.call("HGET", KEYS[1], "state")
    if not state then
        return "MISSING"
    end
    if state == "COMPLETED" or state == "FAILED" or state == "CANCELED" then
        return "FINISHED"
    end
    redis.call("HSET", KEYS[1], "cancel_requested", "1")
    if redis.call("HGET", KEYS[1], "started") ~= "1" then
        redis.call("HSET", KEYS[1], "state", "CANCELED")
    end
    return "REQUESTED"
"#;

const RESERVE_SCRIPT: &str = r#"
    local existing = redis.call("GET", KEYS[1])
    if existing then
        return {existing, 1}
    end
    redis.call("SET", KEYS[1], ARGV[1])
    return {ARGV[1], 0}
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("DEL", KEYS[1])
    end
    return 1
"#;

/// One hash per task under `{prefix}:task:{id}`.
pub struct RedisTaskStore {
    client: redis::Client,
    prefix: String,
    claim: Script,
    progress: Script,
    finish: Script,
    cancel: Script,
}

impl RedisTaskStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            claim: Script::new(CLAIM_SCRIPT),
            progress: Script::new(PROGRESS_SCRIPT),
            finish: Script::new(FINISH_SCRIPT),
            cancel: Script::new(CANCEL_SCRIPT),
        }
    }

    fn task_key(&self, task_id: &str) -> String {
        format!("{}:task:{}", self.prefix, task_id)
    }
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn record_to_fields(record: &TaskRecord) -> Result<Vec<(&'static str, String)>> {
    let mut items = vec![
        ("id", record.id.clone()),
        ("job", record.job.clone()),
        ("state", record.state.as_str().to_string()),
        ("progress", record.progress.to_string()),
        ("cancel_requested", flag(record.cancel_requested)),
        ("started", flag(record.started)),
    ];
    if let Some(result) = &record.result {
        items.push(("result", serde_json::to_string(result)?));
    }
    if let Some(error) = &record.error {
        items.push(("error", error.clone()));
    }
    if let Some(key) = &record.dedup_key {
        items.push(("dedup_key", key.clone()));
    }
    Ok(items)
}

fn record_from_fields(mut fields: HashMap<String, String>) -> Result<TaskRecord> {
    let mut take = |name: &str| {
        fields
            .remove(name)
            .ok_or_else(|| anyhow!("Task hash is missing field: {}", name))
    };
    let id = take("id")?;
    let job = take("job")?;
    let state: TaskState = take("state")?.parse()?;
    let progress: u8 = take("progress")?.parse()?;
    let cancel_requested = take("cancel_requested")? == "1";
    let started = take("started")? == "1";

    let result = fields
        .remove("result")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;

    Ok(TaskRecord {
        id,
        job,
        state,
        progress,
        result,
        error: fields.remove("error"),
        dedup_key: fields.remove("dedup_key"),
        cancel_requested,
        started,
    })
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let items = record_to_fields(&record)?;
        let _: () = conn.hset_multiple(self.task_key(&record.id), &items).await?;
        Ok(())
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(self.task_key(task_id)).await?;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.task_key(task_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        record_from_fields(fields).map(Some)
    }

    async fn claim(&self, task_id: &str) -> Result<Claim> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: String = self
            .claim
            .key(self.task_key(task_id))
            .invoke_async(&mut conn)
            .await?;
        match reply.as_str() {
            "RUN" => Ok(Claim::Run),
            "MISSING" => Ok(Claim::Missing),
            state => Ok(Claim::Skip(state.parse::<TaskState>()?)),
        }
    }

    async fn report_progress(&self, task_id: &str, progress: u8) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let applied: i64 = self
            .progress
            .key(self.task_key(task_id))
            .arg(u32::from(progress.min(100)))
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn finish(&self, task_id: &str, outcome: Outcome) -> Result<bool> {
        let state = outcome.state();
        let payload = match &outcome {
            Outcome::Completed(result) => serde_json::to_string(result)?,
            Outcome::Failed(message) => message.clone(),
            Outcome::Canceled => String::new(),
        };

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let applied: i64 = self
            .finish
            .key(self.task_key(task_id))
            .arg(state.as_str())
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn request_cancel(&self, task_id: &str) -> Result<Option<CancelAck>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: String = self
            .cancel
            .key(self.task_key(task_id))
            .invoke_async(&mut conn)
            .await?;
        match reply.as_str() {
            "MISSING" => Ok(None),
            "FINISHED" => Ok(Some(CancelAck::AlreadyFinished)),
            "REQUESTED" => Ok(Some(CancelAck::CancelRequested)),
            other => Err(anyhow!("Unexpected cancel reply: {}", other)),
        }
    }
}

pub struct RedisJobQueue {
    client: redis::Client,
    queue_key: String,
}

impl RedisJobQueue {
    pub fn new(client: redis::Client, queue_key: String) -> Self {
        Self { client, queue_key }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn push(&self, dispatch: Dispatch) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(&dispatch)?;
        let _: () = conn.lpush(&self.queue_key, serialized).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Dispatch>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // Short BRPOP timeout keeps idle workers responsive to shutdown.
        let result: Option<(String, String)> = conn.brpop(&self.queue_key, 1.0).await?;

        if let Some((_, payload)) = result {
            Ok(Some(serde_json::from_str(&payload)?))
        } else {
            Ok(None)
        }
    }
}

/// Revoked task ids kept in one Redis set, shared by producers and workers.
pub struct RedisCancellation {
    client: redis::Client,
    revoked_key: String,
}

impl RedisCancellation {
    pub fn new(client: redis::Client, revoked_key: String) -> Self {
        Self { client, revoked_key }
    }
}

#[async_trait]
impl CancellationBackend for RedisCancellation {
    async fn request(&self, task_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.sadd(&self.revoked_key, task_id).await?;
        Ok(())
    }

    async fn is_requested(&self, task_id: &str) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let requested: bool = conn.sismember(&self.revoked_key, task_id).await?;
        Ok(requested)
    }

    async fn clear(&self, task_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.srem(&self.revoked_key, task_id).await?;
        Ok(())
    }
}

pub struct RedisDedupIndex {
    client: redis::Client,
    prefix: String,
    reserve: Script,
    release: Script,
}

impl RedisDedupIndex {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            reserve: Script::new(RESERVE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn dedup_key(&self, key: &str) -> String {
        format!("{}:dedup:{}", self.prefix, key)
    }
}

#[async_trait]
impl DedupIndex for RedisDedupIndex {
    async fn lookup_or_reserve(&self, key: &str, task_id: &str) -> Result<(String, bool)> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (id, existed): (String, i64) = self
            .reserve
            .key(self.dedup_key(key))
            .arg(task_id)
            .invoke_async(&mut conn)
            .await?;
        Ok((id, existed == 1))
    }

    async fn release(&self, key: &str, task_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = self
            .release
            .key(self.dedup_key(key))
            .arg(task_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

impl Backends {
    /// All four seams on one Redis, namespaced under `prefix`.
    pub fn redis(client: redis::Client, prefix: &str) -> Self {
        Self {
            store: Arc::new(RedisTaskStore::new(client.clone(), prefix)),
            queue: Arc::new(RedisJobQueue::new(client.clone(), format!("{}:queue", prefix))),
            cancellation: Arc::new(RedisCancellation::new(
                client.clone(),
                format!("{}:revoked", prefix),
            )),
            dedup: Arc::new(RedisDedupIndex::new(client, prefix)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_fields_round_trip() {
        let mut record = TaskRecord::new("t-9".to_string(), "stub".to_string(), Some("k".to_string()));
        record.claim();
        record.finish(Outcome::Completed(json!({"image": "data"})));

        let fields: HashMap<String, String> = record_to_fields(&record)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(fields["state"], "COMPLETED");
        assert_eq!(fields["started"], "1");
        assert_eq!(record_from_fields(fields).unwrap(), record);
    }

    #[test]
    fn missing_fields_are_rejected() {
        let fields = HashMap::from([("id".to_string(), "t".to_string())]);
        assert!(record_from_fields(fields).is_err());
    }
}
