//! Pipeline configuration, built once and passed to the runtime and the
//! activities.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::RuntimeOptions;
use crate::storage::MoveOptions;
use crate::{BackoffStrategy, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Connection identity; a directory root for the local store.
    pub connection: String,
    pub container: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            connection: "./data".to_string(),
            container: "pipeline".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StageConfig {
    pub transform_subpath: String,
    pub sample_subpath: String,
    pub final_subpath: String,
    pub first_sample_size: usize,
    pub second_sample_size: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            transform_subpath: "step1".to_string(),
            sample_subpath: "step3".to_string(),
            final_subpath: "step4".to_string(),
            first_sample_size: 10,
            second_sample_size: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivityRetryConfig {
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles per attempt.
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_ms: Option<u64>,
}

impl Default for ActivityRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 100,
            max_backoff_ms: 30_000,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelocationConfig {
    pub max_poll_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            max_poll_attempts: 10,
            poll_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub stages: StageConfig,
    pub activity_retry: ActivityRetryConfig,
    pub relocation: RelocationConfig,
    /// Activity workers; falls back to the runtime default when absent.
    pub worker_concurrency: Option<usize>,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.storage.container.trim().is_empty() {
            return invalid("storage.container must not be empty");
        }
        if self.stages.first_sample_size == 0 || self.stages.second_sample_size == 0 {
            return invalid("sample sizes must be positive");
        }
        for subpath in [
            &self.stages.transform_subpath,
            &self.stages.sample_subpath,
            &self.stages.final_subpath,
        ] {
            if subpath.trim_matches('/').is_empty() {
                return invalid("stage subpaths must not be empty");
            }
        }
        if self.activity_retry.max_attempts == 0 {
            return invalid("activityRetry.maxAttempts must be at least 1");
        }
        if self.relocation.max_poll_attempts == 0 {
            return invalid("relocation.maxPollAttempts must be at least 1");
        }
        if self.worker_concurrency == Some(0) {
            return invalid("workerConcurrency must be at least 1");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.activity_retry;
        let mut policy = RetryPolicy::new(retry.max_attempts.max(1)).with_backoff(BackoffStrategy::Exponential {
            base: Duration::from_millis(retry.backoff_ms),
            multiplier: 2.0,
            max: Duration::from_millis(retry.max_backoff_ms),
        });
        if let Some(ms) = retry.timeout_ms {
            policy = policy.with_timeout(Duration::from_millis(ms));
        }
        policy
    }

    pub fn move_options(&self) -> MoveOptions {
        MoveOptions {
            poll_interval: Duration::from_millis(self.relocation.poll_interval_ms),
            max_poll_attempts: self.relocation.max_poll_attempts,
        }
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        let defaults = RuntimeOptions::default();
        RuntimeOptions {
            worker_concurrency: self.worker_concurrency.unwrap_or(defaults.worker_concurrency),
            activity_retry: self.retry_policy(),
            ..defaults
        }
    }
}
