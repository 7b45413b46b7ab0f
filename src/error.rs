//! Scheduler error types

use thiserror::Error;

/// Errors returned to the management interface and to the host runtime.
///
/// Contract violations by the caller (double queueing, accounting an empty
/// domain, freeing state that is still linked) are not represented here;
/// they panic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of memory: {0}")]
    NoMemory(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type SchedResult<T> = Result<T, SchedError>;

impl From<std::collections::TryReserveError> for SchedError {
    fn from(e: std::collections::TryReserveError) -> Self {
        SchedError::NoMemory(e.to_string())
    }
}

impl From<serde_yaml::Error> for SchedError {
    fn from(e: serde_yaml::Error) -> Self {
        SchedError::Config(e.to_string())
    }
}
