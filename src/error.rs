//! Error types for assist_traces.
//!
//! All errors are strongly typed using thiserror so that callers (the host
//! command layer in particular) can tell a rejected payload apart from an
//! unknown trace or a closed writer.

use thiserror::Error;

use crate::storage::StorageError;

/// Validation errors raised at the ingestion boundary.
///
/// A payload that fails validation never reaches the trace store or the writer.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Field '{field}' is invalid: {reason}")]
    InvalidField {
        field: String,
        reason: String,
    },

    #[error("Timestamp '{value}' cannot be parsed as a calendar date and time")]
    InvalidTimestamp {
        value: String,
    },

    #[error("Invalid trace payload: {reason}")]
    InvalidPayload {
        reason: String,
    },

    #[error("Invalid option '{option}': {reason}")]
    InvalidOption {
        option: String,
        reason: String,
    },

    #[error("Unknown command: {name}")]
    UnknownCommand {
        name: String,
    },
}

/// Execution errors raised while carrying out a command.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Trace not found: {trace_id}")]
    TraceNotFound {
        trace_id: String,
    },

    #[error("Queue '{queue}' is full (capacity: {capacity})")]
    QueueFull {
        queue: String,
        capacity: usize,
    },

    #[error("Timed out after {duration_ms}ms waiting on '{queue}'")]
    Timeout {
        queue: String,
        duration_ms: u64,
    },

    #[error("Writer is closed and no longer accepts records")]
    WriterClosed,

    #[error("Worker '{worker}' disconnected")]
    Disconnected {
        worker: String,
    },

    #[error("Storage error at {path}: {message}")]
    Storage {
        path: String,
        message: String,
    },

    #[error("Export to {path} failed: {message}")]
    Export {
        path: String,
        message: String,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

/// Top-level error type for assist_traces.
#[derive(Debug, Error)]
pub enum TracesError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Store error: {0}")]
    Store(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl TracesError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if the error reports an unknown trace id.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::TraceNotFound { .. }))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false, // Same payload, same rejection
            Self::Execution(e) => matches!(
                e,
                ExecutionError::QueueFull { .. } | ExecutionError::Timeout { .. }
            ),
            Self::Store(_) | Self::Internal { .. } => false,
        }
    }
}

impl From<serde_json::Error> for TracesError {
    fn from(err: serde_json::Error) -> Self {
        Self::Execution(ExecutionError::Serialization {
            message: err.to_string(),
        })
    }
}

/// Result type alias for assist_traces operations.
pub type TracesResult<T> = Result<T, TracesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_timestamp() {
        let err = ValidationError::InvalidTimestamp {
            value: "yesterday".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("yesterday"));
        assert!(msg.contains("cannot be parsed"));
    }

    #[test]
    fn test_execution_error_queue_full() {
        let err = ExecutionError::QueueFull {
            queue: "writer".to_string(),
            capacity: 4096,
        };
        let msg = format!("{err}");
        assert!(msg.contains("writer"));
        assert!(msg.contains("4096"));
    }

    #[test]
    fn test_traces_error_from_validation() {
        let err: TracesError = ValidationError::MissingField {
            field: "trace_id".to_string(),
        }
        .into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_traces_error_not_found() {
        let err: TracesError = ExecutionError::TraceNotFound {
            trace_id: "t1".to_string(),
        }
        .into();
        assert!(err.is_execution());
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_traces_error_retryable() {
        let full: TracesError = ExecutionError::QueueFull {
            queue: "writer".to_string(),
            capacity: 1,
        }
        .into();
        assert!(full.is_retryable());

        let closed: TracesError = ExecutionError::WriterClosed.into();
        assert!(!closed.is_retryable());

        let internal = TracesError::internal("unexpected state");
        assert!(!internal.is_retryable());
        assert!(format!("{internal}").contains("unexpected state"));
    }

    #[test]
    fn test_serde_error_maps_to_serialization() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: TracesError = err.into();
        assert!(matches!(
            err,
            TracesError::Execution(ExecutionError::Serialization { .. })
        ));
    }
}
