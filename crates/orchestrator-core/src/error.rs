use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Log stream not found: {0}")]
    LogStreamNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Runner unavailable: {0}")]
    RunnerUnavailable(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runner not found: {0}")]
    RunnerNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Transport-agnostic classification of an [`OrchestratorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP-equivalent status for embedding systems that speak HTTP.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::InvalidRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Unavailable => 503,
            ErrorKind::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::InvalidRequest(_) | OrchestratorError::Config(_) => {
                ErrorKind::InvalidRequest
            }
            OrchestratorError::ExecutionNotFound(_)
            | OrchestratorError::TaskNotFound(_)
            | OrchestratorError::LogStreamNotFound(_)
            | OrchestratorError::RunnerNotFound(_) => ErrorKind::NotFound,
            OrchestratorError::Conflict(_) => ErrorKind::Conflict,
            OrchestratorError::RunnerUnavailable(_)
            | OrchestratorError::StoreUnavailable(_)
            | OrchestratorError::Io(_) => ErrorKind::Unavailable,
            OrchestratorError::Internal(_) | OrchestratorError::Json(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
