//! Event bus error primitives.

use thiserror::Error;

use crate::payloads::EventId;

/// Errors raised by the event layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventBusError {
    /// No subscriber was attached when the event was published.
    #[error("event bus has no subscribers")]
    NoSubscribers {
        /// Identifier assigned to the event.
        event_id: EventId,
        /// Event kind string for filtering in logs.
        event_kind: &'static str,
    },
    /// A status label could not be parsed.
    #[error("unknown task status")]
    UnknownStatus {
        /// Raw label that failed to parse.
        value: String,
    },
}

/// Result wrapper for event bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;
