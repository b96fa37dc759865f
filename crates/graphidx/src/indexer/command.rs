//! Runs an external indexing program as a child process.
//!
//! Protocol: the job request is written to the child's stdin as a single
//! JSON document, then stdin is closed. The child prints JSON lines on
//! stdout:
//!
//! ```text
//! {"type":"progress","stage":"extracting_entities","percentage":40,"entities_extracted":12}
//! {"type":"log","message":"loaded 18 files"}
//! {"type":"result","files_processed":18,"entities_extracted":120,"relationships_extracted":64,"artifacts":["entities.parquet"]}
//! ```
//!
//! A zero exit status with a `result` line is success; anything else fails
//! with the tail of stderr.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{ExecutionError, IndexingContext, IndexingOperation, IndexingOutcome};
use crate::config::IndexerCommandConfig;
use crate::job::{IndexingConfig, ProgressUpdate};

/// Program looked up on `PATH` when none is configured.
pub const DEFAULT_PROGRAM: &str = "graphidx-indexer";

/// Bytes of stderr kept for the failure message.
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Serialize)]
struct IndexRequest<'a> {
    job_id: &'a str,
    workspace_id: &'a str,
    data_path: &'a Path,
    config: &'a IndexingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IndexerMessage {
    Progress(ProgressUpdate),
    Result(IndexingOutcome),
    Log { message: String },
}

#[derive(Debug, Clone)]
pub struct CommandIndexer {
    program: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl CommandIndexer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: HashMap::new(),
        }
    }

    pub fn from_config(config: &IndexerCommandConfig) -> Self {
        let program = config
            .program
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROGRAM));
        Self::new(program, config.args.clone()).with_env(config.env.clone())
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

fn tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

fn abort_reader(task: Option<tokio::task::JoinHandle<Vec<u8>>>) {
    if let Some(task) = task {
        task.abort();
    }
}

#[async_trait]
impl IndexingOperation for CommandIndexer {
    async fn run(&self, ctx: IndexingContext) -> Result<IndexingOutcome, ExecutionError> {
        ctx.checkpoint()?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .env("GRAPHIDX_JOB_ID", &ctx.job_id)
            .env("GRAPHIDX_DATA_PATH", &ctx.data_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutionError::Failed(format!(
                    "failed to start indexer '{}': {}",
                    self.program.display(),
                    e
                ))
            })?;

        let request = IndexRequest {
            job_id: &ctx.job_id,
            workspace_id: &ctx.workspace_id,
            data_path: &ctx.data_path,
            config: &ctx.config,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| ExecutionError::Failed(format!("failed to encode request: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            // A child that ignores stdin may exit before we finish writing.
            if let Err(e) = stdin.write_all(&payload).await {
                log::debug!("Indexer stdin closed early for job {}: {}", ctx.job_id, e);
            }
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Failed("indexer stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut outcome = None;

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        log::warn!("Failed to kill indexer for job {}: {}", ctx.job_id, e);
                    }
                    abort_reader(stderr_task);
                    return Err(ExecutionError::Cancelled);
                }
                line = lines.next_line() => {
                    let line = line.map_err(|e| {
                        ExecutionError::Failed(format!("failed to read indexer output: {}", e))
                    })?;
                    let Some(line) = line else { break };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<IndexerMessage>(line) {
                        Ok(IndexerMessage::Progress(update)) => ctx.progress.report(update).await,
                        Ok(IndexerMessage::Result(result)) => outcome = Some(result),
                        Ok(IndexerMessage::Log { message }) => {
                            log::info!("[indexer {}] {}", ctx.job_id, message)
                        }
                        Err(_) => log::debug!("[indexer {}] {}", ctx.job_id, line),
                    }
                }
            }
        }

        let waited = tokio::select! {
            _ = ctx.cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = waited else {
            let _ = child.kill().await;
            abort_reader(stderr_task);
            return Err(ExecutionError::Cancelled);
        };
        let status = status
            .map_err(|e| ExecutionError::Failed(format!("failed to wait for indexer: {}", e)))?;

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if !status.success() {
            let detail = tail(&stderr);
            return Err(ExecutionError::Failed(if detail.is_empty() {
                format!("indexer exited with {}", status)
            } else {
                format!("indexer exited with {}: {}", status, detail)
            }));
        }

        outcome.ok_or_else(|| {
            ExecutionError::Failed("indexer exited without reporting a result".to_string())
        })
    }
}
