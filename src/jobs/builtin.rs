use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::info;

use crate::error::JobError;
use crate::jobs::{Job, JobContext};

/// Simulated inference: a fixed number of timed steps, then one of a set of
/// precomputed outputs selected by `params.index`.
#[derive(Debug)]
pub struct SteppedJob {
    name: String,
    steps: u32,
    step_delay: Duration,
    outputs: Vec<Value>,
}

impl SteppedJob {
    pub fn new(name: impl Into<String>, steps: u32, step_delay: Duration, outputs: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            steps: steps.max(1),
            step_delay,
            outputs,
        }
    }

    fn output_index(params: &Value) -> usize {
        params.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize
    }
}

#[async_trait]
impl Job for SteppedJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, params: &Value) -> Result<()> {
        if let Some(index) = params.get("index") {
            if !index.is_u64() {
                return Err(anyhow!("Parameter `index` must be a non-negative integer"));
            }
        }
        let index = Self::output_index(params);
        if index >= self.outputs.len() {
            return Err(anyhow!(
                "Output index {} out of range ({} outputs loaded)",
                index,
                self.outputs.len()
            ));
        }
        Ok(())
    }

    async fn run(&self, params: Value, ctx: &JobContext) -> Result<Value, JobError> {
        for step in 0..self.steps {
            ctx.checkpoint().await?;
            tokio::time::sleep(self.step_delay).await;
            ctx.report_progress(((step + 1) * 100 / self.steps) as u8).await;
        }

        let index = Self::output_index(&params);
        info!(task_id = %ctx.task_id(), job = %self.name, index, "Stepped run finished");
        self.outputs
            .get(index)
            .cloned()
            .ok_or_else(|| JobError::Failed(format!("No output at index {}", index)))
    }
}

/// Reads every PNG/JPEG file in `dir` (sorted by file name) as a
/// `data:image/...;base64,` string.
pub fn load_image_outputs(dir: &Path) -> Result<Vec<Value>> {
    let mut paths = Vec::new();
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read output directory {}", dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase());
        if matches!(ext.as_deref(), Some("png" | "jpg" | "jpeg")) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut outputs = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = fs::read(&path)
            .with_context(|| format!("Failed to read image {}", path.display()))?;
        let mime = match path.extension().and_then(|s| s.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("png") => "image/png",
            _ => "image/jpeg",
        };
        outputs.push(Value::String(format!(
            "data:{};base64,{}",
            mime,
            STANDARD.encode(bytes)
        )));
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_checks_index() {
        let job = SteppedJob::new("sim", 3, Duration::ZERO, vec![json!("a"), json!("b")]);
        assert!(job.validate(&json!({})).is_ok());
        assert!(job.validate(&json!({"index": 1})).is_ok());
        assert!(job.validate(&json!({"index": 2})).is_err());
        assert!(job.validate(&json!({"index": "one"})).is_err());
    }

    #[test]
    fn loads_images_as_data_uris() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.png"), b"png-bytes").unwrap();
        fs::write(dir.path().join("a.JPG"), b"jpg-bytes").unwrap();
        fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();

        let outputs = load_image_outputs(dir.path()).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(
            outputs[0],
            json!(format!("data:image/jpeg;base64,{}", STANDARD.encode(b"jpg-bytes")))
        );
        assert!(outputs[1].as_str().unwrap().starts_with("data:image/png;base64,"));
    }
}
