//! # Design
//!
//! - Centralize application-level errors for bootstrap and orchestration.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Preserve source errors without re-logging at call sites.

use std::io;

use haul_core::{
    CloudSyncError, EngineError, RepositoryError, ResolveError, TaskStatus, TransitionError,
};
use thiserror::Error;
use uuid::Uuid;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration operations failed.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: haul_config::ConfigError,
    },
    /// Telemetry setup failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Opening the task store failed.
    #[error("task store initialisation failed")]
    Store {
        /// Operation identifier.
        operation: &'static str,
        /// Source data-layer error.
        source: haul_data::DataError,
    },
    /// An engine call failed.
    #[error("engine operation failed")]
    Engine {
        /// Operation identifier.
        operation: &'static str,
        /// Source engine error.
        source: EngineError,
    },
    /// The embedded BitTorrent session could not be created.
    #[error("torrent session initialisation failed")]
    Session {
        /// Source session error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Repository access failed.
    #[error("task repository operation failed")]
    Repository {
        /// Operation identifier.
        operation: &'static str,
        /// Source repository error.
        source: RepositoryError,
    },
    /// A status change was not legal.
    #[error("task status change rejected")]
    Transition {
        /// Source transition error.
        #[from]
        source: TransitionError,
    },
    /// URL resolution failed.
    #[error("url resolution failed")]
    Resolve {
        /// Source resolver error.
        #[from]
        source: ResolveError,
    },
    /// A cloud-sync call failed.
    #[error("cloud-sync operation failed")]
    CloudSync {
        /// Operation identifier.
        operation: &'static str,
        /// Source cloud-sync error.
        source: CloudSyncError,
    },
    /// No record carries the identifier.
    #[error("task not found")]
    NotFound {
        /// Requested identifier.
        id: Uuid,
    },
    /// The record is in a state the operation cannot work from.
    #[error("task is not in a state that allows this operation")]
    InvalidState {
        /// Task identifier.
        id: Uuid,
        /// Operation identifier.
        operation: &'static str,
        /// Status the record was in.
        status: TaskStatus,
    },
    /// An HTTP client could not be built.
    #[error("http client initialisation failed")]
    HttpClient {
        /// Operation identifier.
        operation: &'static str,
        /// Source client error.
        source: reqwest::Error,
    },
    /// IO operations failed.
    #[error("io operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Source IO error.
        source: io::Error,
    },
}

impl AppError {
    pub(crate) const fn engine(operation: &'static str, source: EngineError) -> Self {
        Self::Engine { operation, source }
    }

    pub(crate) const fn repository(operation: &'static str, source: RepositoryError) -> Self {
        Self::Repository { operation, source }
    }

    pub(crate) const fn cloud(operation: &'static str, source: CloudSyncError) -> Self {
        Self::CloudSync { operation, source }
    }

    pub(crate) fn telemetry(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Telemetry {
            operation,
            source: source.into(),
        }
    }

    /// Human-readable detail including the inner cause, for persisting on records.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Engine { source, .. } => source.detail(),
            Self::CloudSync { source, .. } => source.detail(),
            Self::Transition { source } => source.to_string(),
            Self::Resolve { source } => match source {
                ResolveError::Unsupported { url } => format!("unsupported url {url}"),
                ResolveError::Request { url, source } => format!("request to {url} failed: {source}"),
                ResolveError::Status { url, status } => format!("{url} answered {status}"),
            },
            Self::NotFound { id } => format!("task {id} not found"),
            Self::InvalidState {
                operation, status, ..
            } => format!("cannot {operation} a task that is {status}"),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_carries_engine_context() {
        let err = AppError::engine(
            "submit",
            EngineError::Rejected {
                operation: "aria2.addUri",
                message: "disk full".into(),
            },
        );
        assert_eq!(err.to_string(), "engine operation failed");
        assert_eq!(err.detail(), "aria2.addUri rejected: disk full");
    }

    #[test]
    fn transition_errors_convert() {
        let err: AppError = TransitionError {
            from: TaskStatus::Complete,
            to: TaskStatus::Paused,
        }
        .into();
        assert_eq!(
            err.detail(),
            "invalid status transition from complete to paused"
        );
    }

    #[test]
    fn invalid_state_names_the_operation() {
        let err = AppError::InvalidState {
            id: Uuid::nil(),
            operation: "retry",
            status: TaskStatus::Active,
        };
        assert_eq!(err.detail(), "cannot retry a task that is active");
    }
}
