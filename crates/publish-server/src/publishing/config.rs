//! Publishing configuration
//!
//! Tunables for the pipeline and the worker (PUBLISH_* environment variables).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default width of one propagation window, in production ids.
pub const DEFAULT_PROPAGATION_WINDOW: i64 = 100_000;

/// Default number of media/articles handled per aggregation batch.
pub const DEFAULT_CONTENT_BATCH_SIZE: i64 = 1_000;

/// Default number of file lines per attribute-update statement.
pub const DEFAULT_UPDATE_BATCH_SIZE: usize = 2_000;

/// Default wall-clock cap for one queued publish (24 hours).
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 86_400;

/// Default number of times the worker will try one job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishConfig {
    /// Where files fetched from the harvester are staged
    pub tmp_dir: PathBuf,
    /// Base URL of the harvester repository, if publishing from HTTP
    pub harvest_url: Option<String>,
    pub propagation_window: i64,
    pub content_batch_size: i64,
    pub update_batch_size: usize,
    pub job_timeout_secs: u64,
    pub max_attempts: u32,
    /// Keep staged files after the run (debugging)
    pub keep_files: bool,
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir().join("publishing")
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            tmp_dir: default_tmp_dir(),
            harvest_url: None,
            propagation_window: DEFAULT_PROPAGATION_WINDOW,
            content_batch_size: DEFAULT_CONTENT_BATCH_SIZE,
            update_batch_size: DEFAULT_UPDATE_BATCH_SIZE,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            keep_files: false,
        }
    }
}

impl PublishConfig {
    /// Load publishing configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            tmp_dir: std::env::var("PUBLISH_TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_tmp_dir()),
            harvest_url: std::env::var("PUBLISH_HARVEST_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            propagation_window: std::env::var("PUBLISH_PROPAGATION_WINDOW")
                .unwrap_or_else(|_| DEFAULT_PROPAGATION_WINDOW.to_string())
                .parse()
                .unwrap_or(DEFAULT_PROPAGATION_WINDOW),
            content_batch_size: std::env::var("PUBLISH_CONTENT_BATCH_SIZE")
                .unwrap_or_else(|_| DEFAULT_CONTENT_BATCH_SIZE.to_string())
                .parse()
                .unwrap_or(DEFAULT_CONTENT_BATCH_SIZE),
            update_batch_size: std::env::var("PUBLISH_UPDATE_BATCH_SIZE")
                .unwrap_or_else(|_| DEFAULT_UPDATE_BATCH_SIZE.to_string())
                .parse()
                .unwrap_or(DEFAULT_UPDATE_BATCH_SIZE),
            job_timeout_secs: std::env::var("PUBLISH_JOB_TIMEOUT_SECS")
                .unwrap_or_else(|_| DEFAULT_JOB_TIMEOUT_SECS.to_string())
                .parse()
                .unwrap_or(DEFAULT_JOB_TIMEOUT_SECS),
            max_attempts: std::env::var("PUBLISH_MAX_ATTEMPTS")
                .unwrap_or_else(|_| DEFAULT_MAX_ATTEMPTS.to_string())
                .parse()
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            keep_files: std::env::var("PUBLISH_KEEP_FILES")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.propagation_window <= 0 {
            anyhow::bail!("PUBLISH_PROPAGATION_WINDOW must be greater than 0");
        }
        if self.content_batch_size <= 0 {
            anyhow::bail!("PUBLISH_CONTENT_BATCH_SIZE must be greater than 0");
        }
        if self.update_batch_size == 0 {
            anyhow::bail!("PUBLISH_UPDATE_BATCH_SIZE must be greater than 0");
        }
        if self.job_timeout_secs == 0 {
            anyhow::bail!("PUBLISH_JOB_TIMEOUT_SECS must be greater than 0");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("PUBLISH_MAX_ATTEMPTS must be greater than 0");
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}
