//! Indexing job record and its lifecycle transitions.
//!
//! Every writer (scheduler, manager, recovery) mutates a job only through
//! the methods here, so the state machine lives in one place:
//!
//! ```text
//! Queued ──claim──▶ Running ──complete──▶ Completed
//!   │                 │ ├────fail──────▶ Failed ──reset_for_retry──▶ Queued
//!   └──cancel──▶ Cancelled ◀──cancel──┘
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::JobError;
use crate::job::retry;

/// Longest error message stored on a failed job, in characters,
/// including the ellipsis of a truncated one.
pub const MAX_ERROR_MESSAGE_LEN: usize = 2000;

/// Stage label set when a job is claimed, before the operation reports.
pub const STARTING_STAGE: &str = "starting";

/// Current time at the precision the store keeps.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Lifecycle status of an indexing job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(JobError::Validation(format!(
                "Unknown job status '{}'",
                other
            ))),
        }
    }
}

fn default_chunk_size() -> u32 {
    1200
}

fn default_chunk_overlap() -> u32 {
    100
}

fn default_entity_types() -> Vec<String> {
    ["organization", "person", "geo", "event"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_provider() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Indexing configuration captured when the job is created.
///
/// Never changed afterwards: running with different settings means a new job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: u32,
    /// Upper bound on files taken from the corpus.
    #[serde(default)]
    pub max_files: Option<u32>,
    #[serde(default = "default_entity_types")]
    pub entity_types: Vec<String>,
    /// Opaque model/provider settings handed through to the indexer.
    #[serde(default = "default_provider")]
    pub provider: serde_json::Value,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_files: None,
            entity_types: default_entity_types(),
            provider: default_provider(),
        }
    }
}

impl IndexingConfig {
    pub fn validate(&self) -> Result<(), JobError> {
        if self.chunk_size == 0 {
            return Err(JobError::Validation(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(JobError::Validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.max_files == Some(0) {
            return Err(JobError::Validation(
                "max_files must be greater than zero when set".to_string(),
            ));
        }
        if self.entity_types.iter().any(|t| t.trim().is_empty()) {
            return Err(JobError::Validation(
                "entity_types must not contain blank entries".to_string(),
            ));
        }
        if !self.provider.is_object() {
            return Err(JobError::Validation(
                "provider settings must be a JSON object".to_string(),
            ));
        }
        Ok(())
    }
}

/// Payload recorded on a completed job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingResult {
    pub files_processed: u64,
    pub entities_extracted: u64,
    pub relationships_extracted: u64,
    /// References to the artifacts the indexer produced.
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub duration_ms: u64,
}

/// Cumulative progress snapshot reported by a running indexing operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub stage: String,
    #[serde(deserialize_with = "clamped_percentage")]
    pub percentage: u8,
    #[serde(default)]
    pub files_processed: u64,
    #[serde(default)]
    pub entities_extracted: u64,
    #[serde(default)]
    pub relationships_extracted: u64,
}

/// Accepts any JSON number and clamps it into `0..=100`.
fn clamped_percentage<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    Ok(raw.clamp(0.0, 100.0).round() as u8)
}

impl ProgressUpdate {
    pub fn new(stage: impl Into<String>, percentage: u8) -> Self {
        Self {
            stage: stage.into(),
            percentage,
            ..Default::default()
        }
    }

    pub fn with_counts(mut self, files: u64, entities: u64, relationships: u64) -> Self {
        self.files_processed = files;
        self.entities_extracted = entities;
        self.relationships_extracted = relationships;
        self
    }
}

/// One attempt (plus its retries) at indexing a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingJob {
    pub id: String,
    pub workspace_id: String,
    pub config: IndexingConfig,
    pub status: JobStatus,
    /// Current processing phase; only set while running.
    pub stage: Option<String>,
    pub progress_percentage: u8,
    pub result: Option<IndexingResult>,
    pub error_message: Option<String>,
    pub files_processed: u64,
    pub entities_extracted: u64,
    pub relationships_extracted: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Subject of the caller that created the job.
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Scheduler instance executing the job. Only set while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    /// The owner's claim lapses at this instant unless renewed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl IndexingJob {
    pub fn new(
        workspace_id: &str,
        config: IndexingConfig,
        max_retries: u32,
        created_by: Option<&str>,
    ) -> Self {
        let now = now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            config,
            status: JobStatus::Queued,
            stage: None,
            progress_percentage: 0,
            result: None,
            error_message: None,
            files_processed: 0,
            entities_extracted: 0,
            relationships_extracted: 0,
            retry_count: 0,
            max_retries,
            created_by: created_by.map(|s| s.to_string()),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            lease_owner: None,
            lease_expires_at: None,
        }
    }

    fn require(&self, allowed: &[JobStatus], action: &str) -> Result<(), JobError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(JobError::InvalidState(format!(
                "cannot {} job {} while it is {}",
                action, self.id, self.status
            )))
        }
    }

    /// QUEUED → RUNNING.
    pub fn claim(&mut self) -> Result<(), JobError> {
        self.require(&[JobStatus::Queued], "claim")?;
        let now = now();
        self.status = JobStatus::Running;
        self.stage = Some(STARTING_STAGE.to_string());
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Hands a RUNNING job to `owner` until `ttl` from now.
    pub fn take_lease(&mut self, owner: &str, ttl: chrono::Duration) -> Result<(), JobError> {
        self.require(&[JobStatus::Running], "lease")?;
        self.lease_owner = Some(owner.to_string());
        self.lease_expires_at = Some(now() + ttl);
        Ok(())
    }

    /// Extends the lease of `owner`. Fails once the job left RUNNING or
    /// another owner took it over.
    pub fn renew_lease(&mut self, owner: &str, ttl: chrono::Duration) -> Result<(), JobError> {
        self.require_owner(owner)?;
        self.lease_expires_at = Some(now() + ttl);
        Ok(())
    }

    /// A RUNNING job whose owner stopped renewing at `at`. Jobs claimed
    /// without a lease count as expired.
    pub fn lease_expired(&self, at: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.map_or(true, |t| t <= at)
    }

    /// RUNNING and leased to `owner`.
    pub fn require_owner(&self, owner: &str) -> Result<(), JobError> {
        self.require(&[JobStatus::Running], "act on lease of")?;
        if self.lease_owner.as_deref() != Some(owner) {
            return Err(JobError::InvalidState(format!(
                "job {} is leased to {}",
                self.id,
                self.lease_owner.as_deref().unwrap_or("nobody")
            )));
        }
        Ok(())
    }

    fn drop_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }

    /// Folds a progress snapshot into the job without letting anything regress.
    pub fn apply_progress(&mut self, update: &ProgressUpdate) -> Result<(), JobError> {
        self.require(&[JobStatus::Running], "update progress of")?;
        if !update.stage.trim().is_empty() {
            self.stage = Some(update.stage.clone());
        }
        self.progress_percentage = self.progress_percentage.max(update.percentage.min(100));
        self.files_processed = self.files_processed.max(update.files_processed);
        self.entities_extracted = self.entities_extracted.max(update.entities_extracted);
        self.relationships_extracted = self
            .relationships_extracted
            .max(update.relationships_extracted);
        self.updated_at = now();
        Ok(())
    }

    /// RUNNING → COMPLETED.
    pub fn complete(&mut self, result: IndexingResult) -> Result<(), JobError> {
        self.require(&[JobStatus::Running], "complete")?;
        let now = now();
        self.files_processed = self.files_processed.max(result.files_processed);
        self.entities_extracted = self.entities_extracted.max(result.entities_extracted);
        self.relationships_extracted = self
            .relationships_extracted
            .max(result.relationships_extracted);
        self.status = JobStatus::Completed;
        self.progress_percentage = 100;
        self.stage = None;
        self.result = Some(result);
        self.error_message = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.drop_lease();
        Ok(())
    }

    /// RUNNING → FAILED. The message is truncated and never left empty.
    pub fn fail(&mut self, message: &str) -> Result<(), JobError> {
        self.require(&[JobStatus::Running], "fail")?;
        let now = now();
        self.status = JobStatus::Failed;
        self.stage = None;
        self.result = None;
        self.error_message = Some(truncate_message(message));
        self.completed_at = Some(now);
        self.updated_at = now;
        self.drop_lease();
        Ok(())
    }

    /// QUEUED/RUNNING → CANCELLED.
    pub fn cancel(&mut self) -> Result<(), JobError> {
        self.require(&[JobStatus::Queued, JobStatus::Running], "cancel")?;
        let now = now();
        self.status = JobStatus::Cancelled;
        self.stage = None;
        self.result = None;
        self.error_message = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.drop_lease();
        Ok(())
    }

    /// FAILED → QUEUED, clearing runtime fields and counting the retry.
    pub fn reset_for_retry(&mut self) -> Result<(), JobError> {
        if !retry::can_retry(self) {
            return Err(JobError::InvalidState(format!(
                "job {} is {} with {}/{} retries used",
                self.id, self.status, self.retry_count, self.max_retries
            )));
        }
        self.status = JobStatus::Queued;
        self.stage = None;
        self.progress_percentage = 0;
        self.result = None;
        self.error_message = None;
        self.files_processed = 0;
        self.entities_extracted = 0;
        self.relationships_extracted = 0;
        self.started_at = None;
        self.completed_at = None;
        self.retry_count += 1;
        self.updated_at = now();
        self.drop_lease();
        Ok(())
    }

    /// Wall time between start and terminal transition.
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            workspace_id: self.workspace_id.clone(),
            status: self.status,
            stage: self.stage.clone(),
            progress_percentage: self.progress_percentage,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Listing projection of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub workspace_id: String,
    pub status: JobStatus,
    pub stage: Option<String>,
    pub progress_percentage: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn truncate_message(message: &str) -> String {
    let message = message.trim();
    if message.is_empty() {
        return "indexing failed without an error message".to_string();
    }
    if message.chars().count() <= MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(MAX_ERROR_MESSAGE_LEN - 3).collect();
    truncated.push_str("...");
    truncated
}
