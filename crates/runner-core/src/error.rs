//! Error types for pipeline-runner.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid step: {0}")]
    InvalidStep(String),

    #[error("image pull failed: {0}")]
    ImagePull(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("container start failed: {0}")]
    ContainerStart(String),

    #[error("service not ready: {0}")]
    ServiceNotReady(String),

    #[error("cache key file missing: {0}")]
    CacheKeyMissingFile(String),

    #[error("artifact collection failed: {0}")]
    ArtifactCollection(String),

    #[error("variable validation failed: {0}")]
    VariableValidation(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
