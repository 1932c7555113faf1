//! Core Error Types

use thiserror::Error;

/// Main error type for the interception runtime.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no attachable target found")]
    NoTarget,

    #[error("attach failed: {0}")]
    AttachFailed(String),

    #[error("session not found")]
    SessionNotFound,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error on {method}: {message}")]
    Protocol { method: String, message: String },

    #[error("command {0} timed out")]
    CommandTimeout(String),

    #[error("response body fetch timed out")]
    BodyFetchTimeout,

    #[error("rule spec rejected: {0}")]
    Spec(#[from] wiretap_rules::SpecError),

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for runtime operations.
pub type CoreResult<T> = Result<T, CoreError>;
