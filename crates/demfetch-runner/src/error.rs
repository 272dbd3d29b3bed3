//! Error types for the runner.

use crate::job::{JobId, JobState};
use demfetch_dem::{DemError, ErrorKind};
use thiserror::Error;

/// Errors surfaced synchronously by the orchestrator API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error("no coverage in source '{source_id}': {reason}")]
    NoCoverage { source_id: String, reason: String },

    #[error("job {job}: cannot move from {from} to {to}")]
    InvalidTransition {
        job: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("orchestrator is shut down")]
    ShuttingDown,

    #[error("failed to start: {0}")]
    Startup(String),

    #[error(transparent)]
    Dem(#[from] DemError),
}

impl OrchestratorError {
    /// Pipeline error class, where one applies.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            OrchestratorError::NoCoverage { .. } => Some(ErrorKind::NoCoverage),
            OrchestratorError::Dem(e) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("source '{name}': {reason}")]
    Source { name: String, reason: String },

    #[error(transparent)]
    Dem(#[from] DemError),
}
