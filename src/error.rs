use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Fetch failed for {location}: {cause}")]
    Fetch { location: String, cause: String },

    #[error("{stage} stage timed out for {location} after {after:?}")]
    Timeout {
        stage: Stage,
        location: String,
        after: Duration,
    },

    #[error("Decode failed for {location}: {cause}")]
    Decode { location: String, cause: String },

    #[error("Store failed for {}: {cause}", path.display())]
    Store { path: PathBuf, cause: String },

    #[error("Unknown transform kind: {0}")]
    UnknownTransformKind(String),

    #[error("Invalid source location: {0}")]
    InvalidLocation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}

impl PipelineError {
    pub fn fetch(location: impl ToString, cause: impl ToString) -> Self {
        Self::Fetch {
            location: location.to_string(),
            cause: cause.to_string(),
        }
    }

    pub fn decode(location: impl ToString, cause: impl ToString) -> Self {
        Self::Decode {
            location: location.to_string(),
            cause: cause.to_string(),
        }
    }

    pub fn store(path: impl Into<PathBuf>, cause: impl ToString) -> Self {
        Self::Store {
            path: path.into(),
            cause: cause.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Fetch { .. } | PipelineError::Timeout { .. } | PipelineError::Store { .. }
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PipelineError::Fetch { .. } | PipelineError::Timeout { .. } => ErrorSeverity::Low,
            PipelineError::InvalidLocation(_) => ErrorSeverity::Low,
            PipelineError::Decode { .. } | PipelineError::Store { .. } => ErrorSeverity::Medium,
            PipelineError::UnknownTransformKind(_) => ErrorSeverity::High,
            PipelineError::Configuration(_) => ErrorSeverity::High,
            PipelineError::WorkerPool(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }

    /// The pipeline stage this error originated in, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Fetch { .. } => Some(Stage::Fetch),
            PipelineError::Timeout { stage, .. } => Some(*stage),
            PipelineError::Decode { .. } => Some(Stage::Transform),
            PipelineError::Store { .. } => Some(Stage::Store),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// The three sequential stages of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Transform,
    Store,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Transform => "transform",
            Stage::Store => "store",
        };
        f.write_str(name)
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

impl From<AcquireError> for PipelineError {
    fn from(err: AcquireError) -> Self {
        PipelineError::WorkerPool(err.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}
