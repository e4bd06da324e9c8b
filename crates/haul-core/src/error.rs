//! Error types shared by engines and orchestration collaborators.

use thiserror::Error;

use crate::TaskStatus;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failures surfaced by a task engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine does not implement the requested operation.
    #[error("operation not supported by this engine")]
    Unsupported {
        /// Operation that was attempted.
        operation: &'static str,
    },
    /// The handle is not tracked by this engine.
    #[error("unknown engine handle")]
    UnknownHandle {
        /// Handle supplied by the caller.
        handle: String,
    },
    /// The submitted source could not be interpreted.
    #[error("invalid task source")]
    InvalidSource {
        /// Why the source was rejected.
        reason: String,
    },
    /// The backend refused the request.
    #[error("engine rejected the request")]
    Rejected {
        /// Operation that was attempted.
        operation: &'static str,
        /// Backend-provided explanation.
        message: String,
    },
    /// The backend could not be reached.
    #[error("engine transport failure")]
    Transport {
        /// Operation that was attempted.
        operation: &'static str,
        /// Underlying transport error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A bounded wait elapsed.
    #[error("engine operation timed out")]
    Timeout {
        /// Operation that was attempted.
        operation: &'static str,
    },
    /// The operation was cancelled before it finished.
    #[error("engine operation cancelled")]
    Cancelled,
    /// Unexpected internal failure.
    #[error("engine internal failure")]
    Internal {
        /// Operation that was attempted.
        operation: &'static str,
        /// Failure detail.
        message: String,
    },
}

impl EngineError {
    /// Shorthand for wrapping a transport error.
    pub fn transport(
        operation: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            operation,
            source: Box::new(source),
        }
    }

    /// Human-readable detail including the inner cause, for persisting on records.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Unsupported { operation } => format!("{operation} is not supported by this engine"),
            Self::UnknownHandle { handle } => format!("unknown engine handle {handle}"),
            Self::InvalidSource { reason } => format!("invalid task source: {reason}"),
            Self::Rejected { operation, message } => format!("{operation} rejected: {message}"),
            Self::Transport { operation, source } => format!("{operation} failed: {source}"),
            Self::Timeout { operation } => format!("{operation} timed out"),
            Self::Cancelled => "cancelled".to_string(),
            Self::Internal { operation, message } => format!("{operation}: {message}"),
        }
    }
}

/// Illegal lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid status transition from {from} to {to}")]
pub struct TransitionError {
    /// Status the record was in.
    pub from: TaskStatus,
    /// Status that was requested.
    pub to: TaskStatus,
}

/// Failures raised by task repositories.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// No record matched the lookup.
    #[error("task record not found")]
    NotFound {
        /// Lookup key rendered for diagnostics.
        key: String,
    },
    /// A record with the same identifier already exists.
    #[error("task record already exists")]
    Conflict {
        /// Identifier that collided.
        key: String,
    },
    /// The storage backend failed.
    #[error("task repository failure")]
    Backend {
        /// Operation that was attempted.
        operation: &'static str,
        /// Underlying storage error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Failures raised by the cloud-sync capability.
#[derive(Debug, Error)]
pub enum CloudSyncError {
    /// The remote-control endpoint could not be reached.
    #[error("cloud-sync request failed")]
    Request {
        /// Operation that was attempted.
        operation: &'static str,
        /// Underlying HTTP error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The backend answered with an error payload.
    #[error("cloud-sync backend returned an error")]
    Remote {
        /// Operation that was attempted.
        operation: &'static str,
        /// Error text returned by the backend.
        message: String,
    },
    /// The transfer was cancelled through its token.
    #[error("cloud-sync transfer cancelled")]
    Cancelled,
}

impl CloudSyncError {
    /// Human-readable detail including the inner cause.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Request { operation, source } => format!("{operation} failed: {source}"),
            Self::Remote { operation, message } => format!("{operation}: {message}"),
            Self::Cancelled => "transfer cancelled".to_string(),
        }
    }
}

/// Failures raised by the URL resolution capability.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The URL is malformed or uses an unsupported scheme.
    #[error("url cannot be resolved")]
    Unsupported {
        /// Offending URL.
        url: String,
    },
    /// The upstream request failed.
    #[error("url resolution request failed")]
    Request {
        /// URL being resolved.
        url: String,
        /// Underlying HTTP error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The upstream answered with a non-success status.
    #[error("url resolution returned an error status")]
    Status {
        /// URL being resolved.
        url: String,
        /// HTTP status code.
        status: u16,
    },
}
