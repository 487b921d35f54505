use std::path::PathBuf;

use thiserror::Error;

use crate::generation::TrainingStatus;

/// Failure to unpack a downloaded model archive.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("corrupt archive {path:?}: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("i/o error while extracting {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExtractError {
    pub(crate) fn corrupt(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::CorruptArchive {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Failure to resolve a content id into a ready model directory.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid content id {0:?}")]
    InvalidContentId(String),

    #[error("failed to fetch model {content_id}: {reason}")]
    Fetch { content_id: String, reason: String },

    #[error("failed to extract model {content_id}: {source}")]
    Extract {
        content_id: String,
        #[source]
        source: ExtractError,
    },

    #[error("model {content_id} is missing required files: {}", missing.join(", "))]
    Validation {
        content_id: String,
        missing: Vec<String>,
    },

    #[error("cache i/o error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    /// Network-class failures may succeed on a later attempt; a bad archive or
    /// an incomplete model will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Fetch { .. } | CacheError::Io { .. })
    }
}

/// Failure of a single external inference process.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("failed to launch inference process {program:?}: {source}")]
    ProcessLaunch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("inference process exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("inference process produced malformed output: {0}")]
    MalformedOutput(String),
}

impl InferenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InferenceError::ProcessLaunch { .. } | InferenceError::NonZeroExit { .. }
        )
    }

    /// Captured standard error of a failed process, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            InferenceError::NonZeroExit { stderr, .. } => Some(stderr.as_str()),
            _ => None,
        }
    }
}

/// Content store transport or protocol failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("content store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("content store returned status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("content {0} not found")]
    NotFound(String),

    #[error("unexpected content store response: {0}")]
    Protocol(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Http(_) => true,
            StoreError::Status { status, .. } => *status == 429 || *status >= 500,
            StoreError::NotFound(_) | StoreError::Protocol(_) => false,
        }
    }
}

/// Database capability failure.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("invalid database path {0:?}")]
    InvalidPath(String),

    #[error("invalid database url {0:?}")]
    InvalidUrl(String),

    #[error("database request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database returned status {status} for {path}")]
    Status { path: String, status: u16 },

    #[error("value at {path} has unexpected shape: {reason}")]
    Shape { path: String, reason: String },
}

impl DatabaseError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DatabaseError::Http(_) => true,
            DatabaseError::Status { status, .. } => *status == 429 || *status >= 500,
            DatabaseError::InvalidPath(_)
            | DatabaseError::InvalidUrl(_)
            | DatabaseError::Shape { .. } => false,
        }
    }
}

/// Failure of one orchestration run. The first failure stops the run.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("model {owner}/{model_name} not found")]
    ModelNotFound { owner: String, model_name: String },

    #[error("model {owner}/{model_name} is not ready (status: {status})")]
    ModelNotReady {
        owner: String,
        model_name: String,
        status: TrainingStatus,
    },

    #[error("model {owner}/{model_name} is completed but has no content id")]
    MissingModelContentId { owner: String, model_name: String },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("failed to publish generated image: {0}")]
    Publish(#[source] StoreError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl GenerationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Cache(error) => error.is_retryable(),
            GenerationError::Inference(error) => error.is_retryable(),
            GenerationError::Publish(error) => error.is_retryable(),
            GenerationError::Database(error) => error.is_retryable(),
            GenerationError::InvalidRequest(_)
            | GenerationError::ModelNotFound { .. }
            | GenerationError::ModelNotReady { .. }
            | GenerationError::MissingModelContentId { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_assets_are_not_retryable() {
        let validation = CacheError::Validation {
            content_id: "Qm1".into(),
            missing: vec!["config.json".into()],
        };
        assert!(!validation.is_retryable());
        assert!(validation.to_string().contains("config.json"));

        let malformed = InferenceError::MalformedOutput("not json".into());
        assert!(!GenerationError::from(malformed).is_retryable());
    }

    #[test]
    fn transient_faults_are_retryable() {
        let fetch = CacheError::Fetch {
            content_id: "Qm1".into(),
            reason: "timed out".into(),
        };
        assert!(GenerationError::from(fetch).is_retryable());

        let exit = InferenceError::NonZeroExit {
            code: Some(1),
            stderr: "CUDA out of memory".into(),
        };
        assert_eq!(exit.stderr(), Some("CUDA out of memory"));
        assert!(exit.is_retryable());

        let throttled = StoreError::Status {
            url: "https://api.pinata.cloud".into(),
            status: 429,
        };
        assert!(throttled.is_retryable());
    }
}
