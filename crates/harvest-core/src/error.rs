use thiserror::Error;

use crate::task::OperationId;

/// Application-wide error types for harvest.
#[derive(Error, Debug)]
pub enum AppError {
    /// The pool could not start an execution unit (thread or process).
    #[error("Failed to spawn worker {worker_id}: {source}")]
    SpawnFailure {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },

    /// A worker slot was restarted more often than the configured limit allows.
    #[error("Worker {worker_id} exceeded its restart limit ({restarts} restarts)")]
    RestartLimitExceeded { worker_id: usize, restarts: u32 },

    /// Invalid run or client configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A task named an operation that is not registered.
    #[error("Unknown operation: {0}")]
    UnknownOperation(OperationId),

    /// An operation invocation failed (including panics).
    #[error("Operation {operation} failed: {message}")]
    OperationFailed {
        operation: OperationId,
        message: String,
    },

    /// A task's params did not have the shape its operation expects.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The worker <-> supervisor channel broke or carried an unexpected message.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Local I/O failed (pipes, output files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed (fetching a page).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// A selector matched nothing, or a matched value could not be parsed.
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error must abort the whole run.
    ///
    /// Everything an operation can raise is non-fatal: it only crashes the
    /// worker that ran it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::SpawnFailure { .. }
                | AppError::RestartLimitExceeded { .. }
                | AppError::ConfigError(_)
        )
    }

    /// Shorthand used by operations to turn a missing/invalid param into an error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        AppError::InvalidParams(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        let spawn = AppError::SpawnFailure {
            worker_id: 1,
            source: std::io::Error::other("no more threads"),
        };
        assert!(spawn.is_fatal());
        assert!(
            AppError::RestartLimitExceeded {
                worker_id: 2,
                restarts: 5
            }
            .is_fatal()
        );
        assert!(AppError::ConfigError("worker_count must be > 0".into()).is_fatal());
    }

    #[test]
    fn test_operation_errors_are_not_fatal() {
        assert!(!AppError::HttpError("HTTP 500".into()).is_fatal());
        assert!(!AppError::Timeout(30).is_fatal());
        assert!(!AppError::ExtractionError("no h1".into()).is_fatal());
        assert!(!AppError::UnknownOperation(OperationId::new("missing")).is_fatal());
        assert!(
            !AppError::OperationFailed {
                operation: OperationId::new("catalogue.book"),
                message: "boom".into(),
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_spawn_failure_message_names_worker() {
        let err = AppError::SpawnFailure {
            worker_id: 3,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.to_string().contains("worker 3"));
    }
}
