use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::StoreRetry;
use crate::worker::SchedulerSettings;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// External indexing program invoked once per job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexerCommandConfig {
    #[serde(default)]
    pub program: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Top-level settings of the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Defaults to `~/.graphidx/data/graphidx.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: usize,

    #[serde(default = "default_store_retry_base_ms")]
    pub store_retry_base_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Must outlast several poll intervals; runners renew once per interval.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    #[serde(default = "default_stats_window_hours")]
    pub stats_window_hours: u32,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default)]
    pub indexer: IndexerCommandConfig,
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_job_timeout_secs() -> u64 {
    3600
}

fn default_cancel_grace_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_store_retry_attempts() -> usize {
    3
}

fn default_store_retry_base_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_lease_ttl_secs() -> u64 {
    30
}

fn default_stats_window_hours() -> u32 {
    24
}

fn default_event_capacity() -> usize {
    256
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_timeout_secs: default_job_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            default_max_retries: default_max_retries(),
            store_retry_attempts: default_store_retry_attempts(),
            store_retry_base_ms: default_store_retry_base_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
            stats_window_hours: default_stats_window_hours(),
            event_capacity: default_event_capacity(),
            log_format: LogFormat::default(),
            indexer: IndexerCommandConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn store_retry(&self) -> StoreRetry {
        StoreRetry::new(
            self.store_retry_attempts,
            Duration::from_millis(self.store_retry_base_ms),
        )
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent_jobs: self.max_concurrent_jobs,
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            cancel_grace: Duration::from_secs(self.cancel_grace_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            store_retry: self.store_retry(),
        }
    }

    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(crate::db::default_database_path)
    }
}
