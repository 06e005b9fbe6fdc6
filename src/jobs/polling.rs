use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::JobError;
use crate::jobs::{Job, JobContext};

/// Drives an external image-generation API: submit a prompt, poll the
/// returned `polling_url` until the result is ready, then download it.
#[derive(Debug)]
pub struct PollingJob {
    name: String,
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    poll_interval: Duration,
}

impl PollingJob {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: Option<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key,
            poll_interval,
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value, JobError> {
        self.client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(JobError::failed)?
            .json()
            .await
            .map_err(JobError::failed)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, JobError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(JobError::failed)?;
        let bytes = response.bytes().await.map_err(JobError::failed)?;
        Ok(bytes.to_vec())
    }
}

fn prompt_for(params: &Value) -> Result<String, JobError> {
    let mode = params.get("mode").and_then(|v| v.as_str()).unwrap_or("profile");
    match mode {
        "profile" => Ok("profile view of the same person. face turn to the side. same identity".to_string()),
        "color" => {
            let color = params.get("color").and_then(|v| v.as_str()).unwrap_or("dark brown");
            Ok(format!("change hair color to {}, keep same haircut and same identity", color))
        }
        "edit" => Err(JobError::Failed("Edit mode is not implemented yet.".to_string())),
        other => Err(JobError::Failed(format!(
            "Invalid mode `{}`. Choose from 'profile', 'color', or 'edit'.",
            other
        ))),
    }
}

#[async_trait]
impl Job for PollingJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, params: &Value) -> Result<()> {
        if params.get("image").and_then(|v| v.as_str()).is_none() {
            return Err(anyhow!("Missing required parameter: image"));
        }
        match params.get("mode").and_then(|v| v.as_str()) {
            None | Some("profile" | "color" | "edit") => Ok(()),
            Some(other) => Err(anyhow!("Invalid mode: {}", other)),
        }
    }

    async fn run(&self, params: Value, ctx: &JobContext) -> Result<Value, JobError> {
        let image = params
            .get("image")
            .and_then(|v| v.as_str())
            .ok_or_else(|| JobError::Failed("Missing required parameter: image".to_string()))?;
        let prompt = prompt_for(&params)?;

        let payload = json!({
            "output_format": "png",
            "prompt_upsampling": false,
            "safety_tolerance": 6,
            "prompt": prompt,
            "input_image": image,
            "aspect_ratio": "1:1",
        });
        let mut builder = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-key", key);
        }
        let submitted: Value = builder
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(JobError::failed)?
            .json()
            .await
            .map_err(JobError::failed)?;

        let polling_url = submitted
            .get("polling_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| JobError::Failed("Response has no polling_url".to_string()))?
            .to_string();
        info!(task_id = %ctx.task_id(), polling_url = %polling_url, "Generation submitted");

        let mut progress: u8 = 0;
        loop {
            ctx.checkpoint().await?;
            let poll = self.get_json(&polling_url).await?;
            match poll.get("status").and_then(|v| v.as_str()) {
                Some("Pending" | "Processing") => {
                    progress = (progress + 20).min(95);
                    ctx.report_progress(progress).await;
                    debug!(task_id = %ctx.task_id(), progress, "Generation still running");
                    tokio::time::sleep(self.poll_interval).await;
                }
                Some("Ready") => {
                    let sample = poll
                        .pointer("/result/sample")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| JobError::Failed(format!("Ready response has no sample: {}", poll)))?;
                    let bytes = self.download(sample).await?;
                    ctx.report_progress(100).await;
                    return Ok(Value::String(format!(
                        "data:image/png;base64,{}",
                        STANDARD.encode(bytes)
                    )));
                }
                other => {
                    return Err(JobError::Failed(format!(
                        "Generation ended with status {}",
                        other.unwrap_or("<missing>")
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_by_mode() {
        assert!(prompt_for(&json!({})).unwrap().starts_with("profile view"));
        assert_eq!(
            prompt_for(&json!({"mode": "color", "color": "red"})).unwrap(),
            "change hair color to red, keep same haircut and same identity"
        );
        assert_eq!(
            prompt_for(&json!({"mode": "edit"})),
            Err(JobError::Failed("Edit mode is not implemented yet.".to_string()))
        );
        assert!(prompt_for(&json!({"mode": "zoom"})).is_err());
    }

    #[test]
    fn validate_requires_image() {
        let job = PollingJob::new("gen", "http://localhost:1", None, Duration::from_secs(1));
        assert!(job.validate(&json!({"mode": "profile"})).is_err());
        assert!(job.validate(&json!({"image": "abc", "mode": "zoom"})).is_err());
        assert!(job.validate(&json!({"image": "abc", "mode": "edit"})).is_ok());
    }
}
