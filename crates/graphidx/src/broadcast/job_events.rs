//! Job event broadcaster for live job status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{IndexingJob, JobStatus};

/// What happened to a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Queued,
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
    Retried,
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobEventKind::Queued => write!(f, "Queued"),
            JobEventKind::Started => write!(f, "Started"),
            JobEventKind::Progress => write!(f, "Progress"),
            JobEventKind::Completed => write!(f, "Completed"),
            JobEventKind::Failed => write!(f, "Failed"),
            JobEventKind::Cancelled => write!(f, "Cancelled"),
            JobEventKind::Retried => write!(f, "Retried"),
        }
    }
}

/// Snapshot of a job at the moment something happened to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    pub workspace_id: String,
    pub kind: JobEventKind,
    /// Job status after the event.
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub progress_percentage: u8,
    /// Human-readable description, or the error for failures.
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn from_job(kind: JobEventKind, job: &IndexingJob) -> Self {
        let message = match kind {
            JobEventKind::Queued => "Job queued for indexing".to_string(),
            JobEventKind::Started => "Indexing started".to_string(),
            JobEventKind::Progress => job
                .stage
                .clone()
                .unwrap_or_else(|| format!("{}%", job.progress_percentage)),
            JobEventKind::Completed => "Indexing completed successfully".to_string(),
            JobEventKind::Failed => job
                .error_message
                .clone()
                .unwrap_or_else(|| "Indexing failed".to_string()),
            JobEventKind::Cancelled => "Indexing cancelled".to_string(),
            JobEventKind::Retried => format!(
                "Retry {} of {} queued",
                job.retry_count, job.max_retries
            ),
        };

        Self {
            job_id: job.id.clone(),
            workspace_id: job.workspace_id.clone(),
            kind,
            status: job.status,
            stage: job.stage.clone(),
            progress_percentage: job.progress_percentage,
            message,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out of [`JobEvent`]s.
#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn publish(&self, kind: JobEventKind, job: &IndexingJob) {
        self.send(JobEvent::from_job(kind, job));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::IndexingConfig;

    #[test]
    fn test_send_without_receivers() {
        let broadcaster = JobEventBroadcaster::new(4);
        let job = IndexingJob::new("ws", IndexingConfig::default(), 3, None);
        broadcaster.publish(JobEventKind::Queued, &job);
    }

    #[test]
    fn test_publish_receive() {
        let broadcaster = JobEventBroadcaster::new(4);
        let mut rx = broadcaster.subscribe();

        let mut job = IndexingJob::new("ws-1", IndexingConfig::default(), 3, None);
        broadcaster.publish(JobEventKind::Queued, &job);
        job.claim().unwrap();
        job.fail("out of tokens").unwrap();
        broadcaster.publish(JobEventKind::Failed, &job);

        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.kind, JobEventKind::Queued);
        assert_eq!(queued.status, JobStatus::Queued);
        assert_eq!(queued.workspace_id, "ws-1");

        let failed = rx.try_recv().unwrap();
        assert_eq!(failed.kind, JobEventKind::Failed);
        assert_eq!(failed.message, "out of tokens");
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let job = IndexingJob::new("ws", IndexingConfig::default(), 3, None);
        let json = serde_json::to_value(JobEvent::from_job(JobEventKind::Queued, &job)).unwrap();
        assert_eq!(json["kind"], "queued");
        assert_eq!(json["status"], "queued");
        assert!(json.get("jobId").is_some());
        assert!(json.get("stage").is_none());
    }
}
