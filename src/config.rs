use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::jobs::JobRegistry;
use crate::jobs::builtin::{SteppedJob, load_image_outputs};
use crate::jobs::polling::PollingJob;
use crate::runtime::Backends;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Worker slots per pool.
    pub workers: usize,
    /// Cadence of the CLI status poller.
    pub poll_interval_ms: u64,
    pub backend: BackendConfig,
    pub jobs: JobsConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 500,
            backend: BackendConfig::Memory,
            jobs: JobsConfig::default(),
        }
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Memory,
    Redis {
        url: String,
        #[serde(default = "default_prefix")]
        prefix: String,
    },
}

fn default_prefix() -> String {
    "tasktrack".to_string()
}

impl BackendConfig {
    pub fn redis(url: impl Into<String>) -> Self {
        Self::Redis {
            url: url.into(),
            prefix: default_prefix(),
        }
    }

    pub fn build(&self) -> Result<Backends> {
        match self {
            Self::Memory => Ok(Backends::in_memory()),
            Self::Redis { url, prefix } => {
                let client = redis::Client::open(url.as_str())
                    .with_context(|| format!("Invalid Redis URL: {}", url))?;
                Ok(Backends::redis(client, prefix))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub stepped: Option<SteppedJobConfig>,
    pub polling: Option<PollingJobConfig>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            stepped: Some(SteppedJobConfig::default()),
            polling: None,
        }
    }
}

impl JobsConfig {
    pub fn build_registry(&self) -> Result<JobRegistry> {
        let mut registry = JobRegistry::new();

        if let Some(cfg) = &self.stepped {
            let outputs = match &cfg.outputs_dir {
                Some(dir) => load_image_outputs(dir)?,
                None => cfg.outputs.clone(),
            };
            registry.register(Arc::new(SteppedJob::new(
                cfg.name.clone(),
                cfg.steps,
                Duration::from_millis(cfg.step_delay_ms),
                outputs,
            )));
        }

        if let Some(cfg) = &self.polling {
            let api_key = cfg
                .api_key_env
                .as_ref()
                .and_then(|var| std::env::var(var).ok());
            registry.register(Arc::new(PollingJob::new(
                cfg.name.clone(),
                cfg.endpoint.clone(),
                api_key,
                Duration::from_millis(cfg.poll_interval_ms),
            )));
        }

        Ok(registry)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SteppedJobConfig {
    pub name: String,
    pub steps: u32,
    pub step_delay_ms: u64,
    /// Directory of images used as outputs; overrides `outputs`.
    pub outputs_dir: Option<PathBuf>,
    pub outputs: Vec<Value>,
}

impl Default for SteppedJobConfig {
    fn default() -> Self {
        Self {
            name: "model_ht".to_string(),
            steps: 7,
            step_delay_ms: 500,
            outputs_dir: None,
            outputs: vec![json!("ok")],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingJobConfig {
    pub name: String,
    pub endpoint: String,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for PollingJobConfig {
    fn default() -> Self {
        Self {
            name: "model_profile".to_string(),
            endpoint: "https://api.bfl.ai/v1/flux-kontext-pro".to_string(),
            api_key_env: Some("TASKTRACK_API_KEY".to_string()),
            poll_interval_ms: 1000,
        }
    }
}

pub fn load_config_from_yaml(file_path: &str) -> Result<TrackerConfig> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read config file from {}", file_path))?;

    let config: TrackerConfig = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize config from {}", file_path))?;

    Ok(config)
}
