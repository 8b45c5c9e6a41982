//! Error types for the sandbox layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no container pool registered for language '{0}'")]
    NoPool(String),

    #[error("pool for '{language}' failed to warm any containers")]
    WarmUpFailed { language: String },

    #[error("pool unavailable for '{language}': {reason}")]
    PoolUnavailable { language: String, reason: String },

    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),

    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
