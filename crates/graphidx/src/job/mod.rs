//! Indexing job model, retry policy and the store seam.

pub mod record;
pub mod retry;
pub mod store;

pub use record::{
    IndexingConfig, IndexingJob, IndexingResult, JobStatus, JobSummary, ProgressUpdate,
    MAX_ERROR_MESSAGE_LEN,
};
pub use retry::can_retry;
pub use store::{JobStore, SqliteJobStore, StoreRetry};
