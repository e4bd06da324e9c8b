//! Lifecycle status carried by task records and status events.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EventBusError;

/// Closed set of lifecycle states a task record can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Record exists but has never been scheduled.
    #[default]
    Initial,
    /// Queued for submission to a backend.
    Waiting,
    /// Backend is reserving storage for the payload.
    Allocating,
    /// Backend is resolving metadata (magnet lookup, redirects).
    Resolving,
    /// Transfer is running.
    Active,
    /// Transfer is suspended by the user.
    Paused,
    /// Download finished and an upload job is running.
    Uploading,
    /// Terminal success.
    Complete,
    /// Terminal failure; only a retry leaves this state.
    Error,
    /// Backend is post-processing the payload.
    Processing,
}

impl TaskStatus {
    /// Every status, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Initial,
        Self::Waiting,
        Self::Allocating,
        Self::Resolving,
        Self::Active,
        Self::Paused,
        Self::Uploading,
        Self::Complete,
        Self::Error,
        Self::Processing,
    ];

    /// Stable lowercase label used in storage and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Waiting => "waiting",
            Self::Allocating => "allocating",
            Self::Resolving => "resolving",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Uploading => "uploading",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Processing => "processing",
        }
    }

    /// Whether a backend is expected to hold a live handle for the task.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Waiting
                | Self::Allocating
                | Self::Resolving
                | Self::Active
                | Self::Paused
                | Self::Processing
        )
    }

    /// Whether the status is terminal for the download phase.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = EventBusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let status = match value.trim().to_ascii_lowercase().as_str() {
            "" | "initial" => Self::Initial,
            "waiting" => Self::Waiting,
            "allocating" => Self::Allocating,
            "resolving" => Self::Resolving,
            "active" | "downloading" => Self::Active,
            "paused" => Self::Paused,
            "uploading" => Self::Uploading,
            "complete" | "completed" => Self::Complete,
            "error" | "failed" => Self::Error,
            "processing" => Self::Processing,
            _ => {
                return Err(EventBusError::UnknownStatus {
                    value: value.to_string(),
                });
            }
        };
        Ok(status)
    }
}
