//! Configuration management with serde serialization/deserialization
//!
//! This module provides the immutable run configuration handed to the
//! pipeline at construction, plus helpers for loading source lists.

use crate::{PipelineError, Result, SourceLocation, TransformKind, TransformRegistry, WorkerPool};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the pipeline
///
/// # Examples
///
/// ```rust
/// use image_pipeline::PipelineConfig;
///
/// let config = PipelineConfig {
///     worker_threads: Some(4),
///     persist_raw: true,
///     ..Default::default()
/// };
/// assert_eq!(config.pool_size(), 4);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory every artifact is written beneath (default: `./images`)
    pub output_dir: PathBuf,

    /// Worker pool size (default: available hardware threads + 1)
    pub worker_threads: Option<usize>,

    /// Transform tags applied to every image, in order (default: all)
    pub transforms: Vec<String>,

    /// Also store the unmodified fetched image under `raw/` (default: false)
    pub persist_raw: bool,

    /// What a failing unit does to the rest of the run (default: isolate)
    pub failure_policy: FailurePolicy,

    /// Time budget for a single fetch unit, retries included (default: 30 seconds)
    pub fetch_timeout: Duration,

    /// Time budget for one fetch attempt; must be shorter than `fetch_timeout`
    /// (default: 10 seconds)
    pub request_timeout: Duration,

    /// Retry policy applied by the fetch collaborator
    pub retry: RetryConfig,

    /// Delete the run's artifacts once it has been reported (default: true)
    pub cleanup_after_run: bool,

    /// Custom User-Agent string for HTTP fetches
    pub user_agent: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("images"),
            worker_threads: None,
            transforms: TransformKind::ALL.iter().map(|k| k.tag().to_string()).collect(),
            persist_raw: false,
            failure_policy: FailurePolicy::default(),
            fetch_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            cleanup_after_run: true,
            user_agent: None,
        }
    }
}

impl PipelineConfig {
    /// Read a JSON config file. Synchronous so it can run before the runtime exists.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Resolved worker pool size.
    pub fn pool_size(&self) -> usize {
        self.worker_threads.unwrap_or_else(WorkerPool::default_size)
    }

    pub fn registry(&self) -> Result<TransformRegistry> {
        TransformRegistry::from_tags(&self.transforms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == Some(0) {
            return Err(PipelineError::Configuration(
                "Worker threads must be greater than 0".to_string(),
            ));
        }

        if self.fetch_timeout.is_zero() {
            return Err(PipelineError::Configuration(
                "Fetch timeout must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() || self.request_timeout >= self.fetch_timeout {
            return Err(PipelineError::Configuration(
                "Request timeout must be greater than 0 and shorter than the fetch timeout"
                    .to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Configuration(
                "Retry attempts must be greater than 0".to_string(),
            ));
        }

        if self.output_dir.as_os_str().is_empty() {
            return Err(PipelineError::Configuration(
                "Output directory must not be empty".to_string(),
            ));
        }

        self.registry().map(|_| ())
    }
}

/// How the orchestrator reacts to a failing unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and keep every other unit's result
    #[default]
    Isolate,
    /// Abort the whole run on the first failing stage; nothing is kept
    FailFast,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt + 1`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay as u64);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}

/// Parse newline-separated source locations; blank lines and `#` comments are skipped.
pub fn parse_sources(content: &str) -> Result<Vec<SourceLocation>> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(SourceLocation::parse)
        .collect()
}

pub async fn load_sources(path: &Path) -> Result<Vec<SourceLocation>> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_sources(&content)
}
