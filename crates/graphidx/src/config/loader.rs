use std::path::Path;

use crate::config::schema::OrchestratorConfig;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<OrchestratorConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<OrchestratorConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        log::debug!("No config at {}, using defaults", path.display());
        return Ok(OrchestratorConfig::default());
    }
    load_config(path)
}

pub fn load_config_from_str(content: &str) -> Result<OrchestratorConfig, ConfigError> {
    let config: OrchestratorConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &OrchestratorConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_jobs == 0 {
        return Err(ConfigError::Validation {
            message: "maxConcurrentJobs must be at least 1".to_string(),
        });
    }
    if config.job_timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "jobTimeoutSecs must be greater than zero".to_string(),
        });
    }
    if config.store_retry_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "storeRetryAttempts must be at least 1".to_string(),
        });
    }
    if config.poll_interval_ms == 0 {
        return Err(ConfigError::Validation {
            message: "pollIntervalMs must be greater than zero".to_string(),
        });
    }
    if config.lease_ttl_secs.saturating_mul(1000) <= config.poll_interval_ms {
        return Err(ConfigError::Validation {
            message: "leaseTtlSecs must be longer than pollIntervalMs".to_string(),
        });
    }
    if config.stats_window_hours == 0 {
        return Err(ConfigError::Validation {
            message: "statsWindowHours must be greater than zero".to_string(),
        });
    }
    if config.event_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "eventCapacity must be at least 1".to_string(),
        });
    }
    if let Some(program) = &config.indexer.program {
        if program.as_os_str().is_empty() {
            return Err(ConfigError::Validation {
                message: "indexer.program must not be empty".to_string(),
            });
        }
    }

    Ok(())
}
