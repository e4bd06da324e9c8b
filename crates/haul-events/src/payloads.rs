//! Event payload types carried across the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::TaskStatus;

/// Identifier assigned to each event emitted on the bus.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Per-file progress for multi-file tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileProgress {
    /// Zero-based file index inside the task payload.
    pub index: usize,
    /// Path relative to the task's download directory.
    pub path: String,
    /// Bytes completed for this file.
    pub downloaded: u64,
    /// Declared size of this file.
    pub total: u64,
}

/// Typed domain events surfaced to presentation layers and the upload service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A task record was created and handed to a backend.
    TaskCreated {
        /// Task identifier.
        task_id: Uuid,
        /// Human-readable filename.
        filename: String,
        /// Backend that accepted the task.
        backend: String,
    },
    /// Periodic progress sample for a running download.
    TaskProgress {
        /// Task identifier.
        task_id: Uuid,
        /// Bytes transferred so far.
        downloaded: u64,
        /// Total bytes expected (zero when unknown).
        total: u64,
        /// Current throughput in bytes per second.
        speed: u64,
        /// Estimated seconds remaining, when computable.
        eta_seconds: Option<u64>,
        /// Per-file breakdown for multi-file payloads.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files: Vec<FileProgress>,
    },
    /// Task moved between lifecycle states.
    TaskStatusChanged {
        /// Task identifier.
        task_id: Uuid,
        /// Previous status.
        from: TaskStatus,
        /// New status.
        to: TaskStatus,
    },
    /// Download phase finished.
    TaskCompleted {
        /// Task identifier.
        task_id: Uuid,
        /// Local path of the downloaded payload.
        path: String,
        /// Status persisted after completion.
        status: TaskStatus,
    },
    /// Download phase failed.
    TaskFailed {
        /// Task identifier.
        task_id: Uuid,
        /// Failure detail.
        message: String,
    },
    /// Task record was deleted.
    TaskRemoved {
        /// Task identifier.
        task_id: Uuid,
    },
    /// Upload job was submitted to the cloud-sync backend.
    UploadStarted {
        /// Task identifier.
        task_id: Uuid,
        /// Job handle assigned by the cloud-sync backend.
        job_id: String,
        /// Remote destination path.
        destination: String,
    },
    /// Upload job progress sample.
    UploadProgress {
        /// Task identifier.
        task_id: Uuid,
        /// Job handle.
        job_id: String,
        /// Bytes uploaded so far.
        transferred: u64,
        /// Total bytes to upload.
        total: u64,
        /// Current throughput in bytes per second.
        speed: u64,
    },
    /// Upload job finished successfully.
    UploadCompleted {
        /// Task identifier.
        task_id: Uuid,
        /// Job handle.
        job_id: String,
        /// Status persisted after the upload.
        status: TaskStatus,
    },
    /// Upload job could not be created or failed.
    UploadFailed {
        /// Task identifier.
        task_id: Uuid,
        /// Job handle when one was assigned.
        job_id: Option<String>,
        /// Failure detail, prefixed with the upload phase.
        message: String,
    },
    /// Settings were reloaded and pushed to the engines.
    SettingsChanged {
        /// Description of the applied change.
        description: String,
    },
}

impl Event {
    /// Machine-friendly discriminator for consumers and metrics labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task_created",
            Self::TaskProgress { .. } => "task_progress",
            Self::TaskStatusChanged { .. } => "task_status_changed",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskRemoved { .. } => "task_removed",
            Self::UploadStarted { .. } => "upload_started",
            Self::UploadProgress { .. } => "upload_progress",
            Self::UploadCompleted { .. } => "upload_completed",
            Self::UploadFailed { .. } => "upload_failed",
            Self::SettingsChanged { .. } => "settings_changed",
        }
    }

    /// Task the event refers to, if any.
    #[must_use]
    pub const fn task_id(&self) -> Option<Uuid> {
        match self {
            Self::TaskCreated { task_id, .. }
            | Self::TaskProgress { task_id, .. }
            | Self::TaskStatusChanged { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskRemoved { task_id }
            | Self::UploadStarted { task_id, .. }
            | Self::UploadProgress { task_id, .. }
            | Self::UploadCompleted { task_id, .. }
            | Self::UploadFailed { task_id, .. } => Some(*task_id),
            Self::SettingsChanged { .. } => None,
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and emission timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recording when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}
