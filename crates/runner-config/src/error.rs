//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("no such pipeline: {0}")]
    NoSuchPipeline(String),

    #[error("variable validation failed: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for runner_core::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation(msg) => runner_core::Error::VariableValidation(msg),
            ConfigError::InvalidReference(msg) => runner_core::Error::InvalidStep(msg),
            other => runner_core::Error::Internal(other.to_string()),
        }
    }
}
