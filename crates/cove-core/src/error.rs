use std::path::PathBuf;

use thiserror::Error;

/// Startup and environment failures. These abort a run before any record begins.
#[derive(Debug, Error)]
pub enum CoveError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error("result artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoveError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    pub fn artifact(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        Self::Artifact {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// Failure surfaced by the reasoning service boundary.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The backend is temporarily overloaded; the call may be retried.
    #[error("reasoning service overloaded: {0}")]
    Overloaded(String),
    #[error("reasoning service failure: {0}")]
    Failed(String),
}

impl ServiceError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Overloaded(_))
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// Failure of one pipeline stage for one evidence item.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("malformed verification questions for evidence {evidence}: {reason}")]
    StructuralParse { evidence: usize, reason: String },
    #[error("verification gave up after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: ServiceError,
    },
    #[error(transparent)]
    Service(#[from] ServiceError),
}
