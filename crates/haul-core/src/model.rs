//! Task record and engine-facing DTOs.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, TransitionError};
use crate::lifecycle::validate_transition;
use crate::source::TaskSource;
use crate::{FileProgress, TaskStatus};

/// Concrete executor that owns a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// External daemon driven over JSON-RPC.
    Remote,
    /// BitTorrent and HTTP transfers running inside this process.
    InProcess,
}

impl Backend {
    /// Stable label used in logs, metrics, and storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::InProcess => "in_process",
        }
    }
}

impl Display for Backend {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "remote" | "aria2" => Ok(Self::Remote),
            "in_process" | "inprocess" | "inproc" | "native" => Ok(Self::InProcess),
            other => Err(EngineError::Internal {
                operation: "parse backend",
                message: format!("unknown backend '{other}'"),
            }),
        }
    }
}

/// Opaque, backend-assigned handle for a running task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineHandle(String);

impl EngineHandle {
    /// Wrap a backend-provided identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EngineHandle {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for EngineHandle {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EngineHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Per-task knobs mapped onto each backend's own vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Extra request headers for HTTP sources.
    pub headers: BTreeMap<String, String>,
    /// Target directory; the engine default applies when absent.
    pub directory: Option<PathBuf>,
    /// Output filename override for single-file downloads.
    pub filename: Option<String>,
    /// Download speed cap in bytes per second.
    pub max_download_speed: Option<u64>,
    /// Connection cap per server.
    pub max_connections: Option<u32>,
    /// Zero-based indices of files to fetch; empty means every file.
    pub selected_files: Vec<usize>,
}

/// Submission request handed to an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    /// What to fetch.
    pub source: TaskSource,
    /// How to fetch it.
    pub options: SubmitOptions,
}

impl SubmitRequest {
    /// Build a request with default options.
    #[must_use]
    pub fn new(source: TaskSource) -> Self {
        Self {
            source,
            options: SubmitOptions::default(),
        }
    }
}

/// Options for removing a task from an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Delete downloaded data alongside the engine entry.
    pub delete_files: bool,
}

/// Point-in-time view of one engine task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Engine handle.
    pub handle: EngineHandle,
    /// Backend that owns the handle.
    pub backend: Backend,
    /// Status as reported by the engine.
    pub status: TaskStatus,
    /// Display name, when known.
    pub name: Option<String>,
    /// Bytes transferred.
    pub downloaded: u64,
    /// Total bytes expected (zero when unknown).
    pub total: u64,
    /// Throughput in bytes per second.
    pub speed: u64,
    /// Estimated seconds remaining.
    pub eta_seconds: Option<u64>,
    /// Per-file breakdown.
    #[serde(default)]
    pub files: Vec<FileProgress>,
    /// Payload path once known.
    pub path: Option<String>,
    /// Failure detail for errored tasks.
    pub error: Option<String>,
}

impl TaskSnapshot {
    /// Empty snapshot for a handle.
    #[must_use]
    pub const fn new(handle: EngineHandle, backend: Backend, status: TaskStatus) -> Self {
        Self {
            handle,
            backend,
            status,
            name: None,
            downloaded: 0,
            total: 0,
            speed: 0,
            eta_seconds: None,
            files: Vec::new(),
            path: None,
            error: None,
        }
    }
}

/// Compute a remaining-time estimate from byte counters and throughput.
#[must_use]
pub fn eta_seconds(downloaded: u64, total: u64, speed: u64) -> Option<u64> {
    if speed == 0 || total == 0 || downloaded >= total {
        return None;
    }
    Some((total - downloaded).div_ceil(speed))
}

/// Durable record for one user-submitted task.
///
/// `engine_id` is only meaningful while the record is in flight; completion and
/// failure clear it unless an upload is still pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Record identifier.
    pub id: Uuid,
    /// URL as submitted.
    pub url: String,
    /// URL after resolution.
    pub resolved_url: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Human-readable filename.
    pub filename: String,
    /// Declared size in bytes.
    pub total_bytes: u64,
    /// Bytes transferred.
    pub downloaded_bytes: u64,
    /// Last observed throughput.
    pub speed: u64,
    /// Last observed remaining-time estimate.
    pub eta_seconds: Option<u64>,
    /// Failure detail; `None` while healthy.
    pub error: Option<String>,
    /// Remote upload destination; `None` disables auto-upload.
    pub destination: Option<String>,
    /// Request headers obtained during resolution.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Backend-assigned handle.
    pub engine_id: Option<String>,
    /// Backend that owns `engine_id`.
    pub backend: Option<Backend>,
    /// Cloud-sync job handle for the upload phase.
    pub upload_job: Option<String>,
    /// Local payload path reported on completion.
    pub local_path: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First time the task went active.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Fresh record in the `Initial` state.
    #[must_use]
    pub fn new(url: impl Into<String>, filename: impl Into<String>) -> Self {
        let now = Utc::now();
        let url = url.into();
        Self {
            id: Uuid::new_v4(),
            resolved_url: url.clone(),
            url,
            status: TaskStatus::Initial,
            filename: filename.into(),
            total_bytes: 0,
            downloaded_bytes: 0,
            speed: 0,
            eta_seconds: None,
            error: None,
            destination: None,
            headers: BTreeMap::new(),
            engine_id: None,
            backend: None,
            upload_job: None,
            local_path: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Whether a completed download should be handed to the upload service.
    #[must_use]
    pub fn wants_upload(&self) -> bool {
        self.destination.as_deref().is_some_and(|dest| !dest.trim().is_empty())
    }

    /// Move to `to` after validating the pair; same-status calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns the [`TransitionError`] and leaves the record untouched when the
    /// pair is not allowed.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), TransitionError> {
        if self.status == to {
            return Ok(());
        }
        validate_transition(self.status, to)?;
        let now = Utc::now();
        match to {
            TaskStatus::Active if self.started_at.is_none() => self.started_at = Some(now),
            TaskStatus::Complete => self.completed_at = Some(now),
            TaskStatus::Waiting => {
                self.error = None;
                self.completed_at = None;
            }
            _ => {}
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Forget the backend handle.
    pub fn clear_handle(&mut self) {
        self.engine_id = None;
        self.backend = None;
        self.speed = 0;
        self.eta_seconds = None;
    }
}
