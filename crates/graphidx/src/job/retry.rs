//! Retry eligibility.

use super::record::{IndexingJob, JobStatus};

/// A job may be retried only after failing, and only while it has retries left.
///
/// Both `IndexingManager::can_retry` and `IndexingManager::retry_job` go
/// through this function so they always agree.
pub fn can_retry(job: &IndexingJob) -> bool {
    job.status == JobStatus::Failed && job.retry_count < job.max_retries
}
