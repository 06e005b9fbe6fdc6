use clap::{Parser, Subcommand};
use tasktrack::runtime::dedup::derive_key;
use tasktrack::config::{BackendConfig, TrackerConfig, load_config_from_yaml};
use tasktrack::{TaskTracker, TrackerError, StatusDocument, WorkerPool};
use std::sync::Arc;
use std::path::PathBuf;
use anyhow::Result;
use serde_json::{Map, Value};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a YAML config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one job in memory and poll it to completion (Standalone Mode)
    Run {
        /// Job kind to run
        #[arg(long, short)]
        job: String,

        /// Job params (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        params: Vec<(String, Value)>,

        #[arg(long)]
        dedup_key: Option<String>,

        /// Collapse submissions carrying the same file contents
        #[arg(long)]
        dedup_file: Option<PathBuf>,
    },

    /// Start a worker pool connecting to Redis (Distributed Mode)
    Worker {
        /// Redis connection URL
        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        /// Worker slots, overrides the config file
        #[arg(long)]
        workers: Option<usize>,

        /// Worker Name (for logging)
        #[arg(long, default_value = "worker")]
        name: String,
    },

    /// Submit a job to Redis for workers to execute (Client Mode)
    Submit {
        #[arg(long, short)]
        job: String,

        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        #[arg(long, short = 'D', value_parser = parse_key_val)]
        params: Vec<(String, Value)>,

        #[arg(long)]
        dedup_key: Option<String>,

        /// Collapse submissions carrying the same file contents
        #[arg(long)]
        dedup_file: Option<PathBuf>,
    },

    /// Print the status document of a task
    Status {
        task_id: String,

        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,
    },

    /// Request cancellation of a task
    Cancel {
        task_id: String,

        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

fn dedup_key_for(dedup_key: Option<&str>, dedup_file: Option<&PathBuf>) -> Result<Option<String>> {
    let content = dedup_file.map(std::fs::read).transpose()?;
    Ok(derive_key(dedup_key, content.as_deref()))
}

fn params_object(params: Vec<(String, Value)>) -> Value {
    Value::Object(params.into_iter().collect::<Map<_, _>>())
}

/// Redis at `url`, keeping the key prefix from the config file if it names one.
fn redis_backend(config: &TrackerConfig, url: String) -> BackendConfig {
    match &config.backend {
        BackendConfig::Redis { prefix, .. } => BackendConfig::Redis { url, prefix: prefix.clone() },
        BackendConfig::Memory => BackendConfig::redis(url),
    }
}

fn tracker_for(config: &TrackerConfig, backend: &BackendConfig) -> Result<TaskTracker> {
    let backends = backend.build()?;
    let jobs = Arc::new(config.jobs.build_registry()?);
    Ok(TaskTracker::new(backends, jobs))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config_from_yaml(&path.to_string_lossy())?,
        None => TrackerConfig::default(),
    };

    match cli.command {
        Commands::Run { job, params, dedup_key, dedup_file } => {
            info!("Running in Standalone Memory Mode");
            let tracker = tracker_for(&config, &BackendConfig::Memory)?;
            let pool = WorkerPool::start(
                tracker.backends().clone(),
                Arc::new(tracker.jobs().clone()),
                config.workers,
            );

            let key = dedup_key_for(dedup_key.as_deref(), dedup_file.as_ref())?;
            let task_id = tracker.submit(&job, params_object(params), key.as_deref()).await?;
            info!("Task submitted: {}", task_id);

            loop {
                let status = tracker.status(&task_id).await?;
                print_json(&status)?;
                if status.is_terminal() {
                    break;
                }
                tokio::time::sleep(config.poll_interval()).await;
            }
            pool.shutdown();
        }

        Commands::Worker { redis, workers, name } => {
            info!("[{}] Starting Worker... Redis: {}", name, redis);
            let tracker = tracker_for(&config, &redis_backend(&config, redis))?;
            info!("[{}] Registered jobs: {:?}", name, tracker.jobs().names());

            let pool = WorkerPool::start(
                tracker.backends().clone(),
                Arc::new(tracker.jobs().clone()),
                workers.unwrap_or(config.workers),
            );
            info!("[{}] Worker ready with {} slots.", name, pool.capacity());
            pool.join().await;
        }

        Commands::Submit { job, redis, params, dedup_key, dedup_file } => {
            info!("Submitting to Redis: {}", redis);
            let tracker = tracker_for(&config, &redis_backend(&config, redis))?;
            let key = dedup_key_for(dedup_key.as_deref(), dedup_file.as_ref())?;
            let task_id = tracker.submit(&job, params_object(params), key.as_deref()).await?;
            print_json(&serde_json::json!({ "task_id": task_id }))?;
        }

        Commands::Status { task_id, redis } => {
            let tracker = tracker_for(&config, &redis_backend(&config, redis))?;
            match tracker.status(&task_id).await {
                Ok(status) => print_json(&status)?,
                Err(TrackerError::NotFound { .. }) => print_json(&StatusDocument::unknown())?,
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Cancel { task_id, redis } => {
            let tracker = tracker_for(&config, &redis_backend(&config, redis))?;
            let ack = tracker.cancel(&task_id).await?;
            print_json(&ack)?;
        }
    }

    Ok(())
}
