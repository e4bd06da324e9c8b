//! Error types for the data access layer.

use haul_core::RepositoryError;
use thiserror::Error;

/// Result alias for data layer operations.
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors raised by the data access layer.
#[derive(Debug, Error)]
pub enum DataError {
    /// Migration execution failed.
    #[error("migration failed")]
    MigrationFailed {
        /// Underlying migration error.
        #[source]
        source: sqlx::migrate::MigrateError,
    },
    /// A database operation failed.
    #[error("database operation failed")]
    QueryFailed {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying SQL error.
        #[source]
        source: sqlx::Error,
    },
    /// A stored row could not be mapped onto a task record.
    #[error("stored task row is malformed")]
    Malformed {
        /// Column that failed to decode.
        column: &'static str,
        /// Offending value.
        value: String,
    },
}

impl From<DataError> for RepositoryError {
    fn from(err: DataError) -> Self {
        let operation = match &err {
            DataError::MigrationFailed { .. } => "migrate",
            DataError::QueryFailed { operation, .. } => *operation,
            DataError::Malformed { .. } => "decode row",
        };
        Self::Backend {
            operation,
            source: Box::new(err),
        }
    }
}
