//! Engine contract implemented by every backend and by the hybrid router.
//!
//! # Design
//! - Engines receive an [`EngineEvents`] sender at construction and report
//!   progress, completion and failure through it from their own tasks.
//! - Sends never block, so an engine sampler cannot stall on a slow consumer.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::model::{Backend, EngineHandle, RemoveOptions, SubmitRequest, TaskSnapshot};
use crate::source::SourceKind;
use crate::FileProgress;

/// One progress observation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSample {
    /// Bytes transferred.
    pub downloaded: u64,
    /// Total bytes expected (zero when unknown).
    pub total: u64,
    /// Throughput in bytes per second.
    pub speed: u64,
    /// Estimated seconds remaining.
    pub eta_seconds: Option<u64>,
    /// Per-file breakdown for multi-file tasks.
    pub files: Vec<FileProgress>,
}

/// What happened to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEventKind {
    /// Periodic sample.
    Progress(ProgressSample),
    /// Terminal success with the payload's local path.
    Completed {
        /// Final on-disk location.
        path: PathBuf,
    },
    /// Terminal failure.
    Failed {
        /// Failure detail.
        message: String,
    },
}

/// Event emitted by an engine for one of its handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    /// Handle the event refers to.
    pub handle: EngineHandle,
    /// Payload.
    pub kind: EngineEventKind,
}

impl EngineEvent {
    /// Whether the event ends the task's life inside the engine.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self.kind, EngineEventKind::Progress(_))
    }
}

/// Receiving half of the engine event channel.
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Sending half handed to engines at construction.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

/// Create a connected engine event channel.
#[must_use]
pub fn engine_events() -> (EngineEvents, EngineEventReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EngineEvents { sender }, receiver)
}

impl EngineEvents {
    /// Emit an event; dropped silently once the consumer has gone away.
    pub fn emit(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            debug!("engine event consumer closed; dropping event");
        }
    }

    /// Emit a progress sample.
    pub fn progress(&self, handle: &EngineHandle, sample: ProgressSample) {
        self.emit(EngineEvent {
            handle: handle.clone(),
            kind: EngineEventKind::Progress(sample),
        });
    }

    /// Emit a completion.
    pub fn completed(&self, handle: &EngineHandle, path: impl Into<PathBuf>) {
        self.emit(EngineEvent {
            handle: handle.clone(),
            kind: EngineEventKind::Completed { path: path.into() },
        });
    }

    /// Emit a failure.
    pub fn failed(&self, handle: &EngineHandle, message: impl Into<String>) {
        self.emit(EngineEvent {
            handle: handle.clone(),
            kind: EngineEventKind::Failed {
                message: message.into(),
            },
        });
    }
}

/// Settings pushed into engines whenever configuration changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Backend chosen for magnet and torrent sources.
    pub torrent_backend: Backend,
    /// Backend chosen for direct URLs.
    pub http_backend: Backend,
    /// Default download directory.
    pub download_dir: PathBuf,
    /// Concurrent downloads the remote daemon may run.
    pub max_concurrent: u32,
    /// Connections per server for HTTP transfers.
    pub max_connections_per_server: u32,
    /// Segments per HTTP transfer.
    pub split: u32,
    /// Global download cap in bytes per second (zero = unlimited).
    pub download_limit: u64,
    /// How long a magnet may wait for metadata.
    pub metadata_timeout: Duration,
    /// Parallel streams for in-process HTTP fetches.
    pub http_streams: u32,
    /// Low-level retries for in-process HTTP fetches.
    pub http_retries: u32,
    /// Proxy URL for in-process HTTP fetches.
    pub proxy: Option<String>,
    /// Skip TLS certificate verification.
    pub insecure_tls: bool,
    /// User agent for in-process HTTP fetches.
    pub user_agent: Option<String>,
}

impl EngineSettings {
    /// Backend preferred for a source kind.
    #[must_use]
    pub const fn backend_for(&self, kind: SourceKind) -> Backend {
        match kind {
            SourceKind::Torrent => self.torrent_backend,
            SourceKind::Http => self.http_backend,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            torrent_backend: Backend::InProcess,
            http_backend: Backend::Remote,
            download_dir: PathBuf::from("downloads"),
            max_concurrent: 5,
            max_connections_per_server: 16,
            split: 16,
            download_limit: 0,
            metadata_timeout: Duration::from_secs(60),
            http_streams: 4,
            http_retries: 3,
            proxy: None,
            insecure_tls: false,
            user_agent: None,
        }
    }
}

/// Capability set every backend implements.
///
/// Event delivery happens on engine-owned tasks; callers must not assume an
/// event is emitted before the triggering call returns.
#[async_trait]
pub trait TaskEngine: Send + Sync {
    /// Backend identity.
    fn backend(&self) -> Backend;

    /// Backend that owns `handle`; single-backend engines answer for themselves.
    fn backend_of(&self, handle: &EngineHandle) -> Backend {
        let _ = handle;
        self.backend()
    }

    /// Bring the engine up (connect, spawn samplers).
    async fn start(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Shut the engine down and drop transient task handles.
    async fn stop(&self) -> EngineResult<()> {
        Ok(())
    }

    /// Accept a task and return its handle.
    async fn submit(&self, request: SubmitRequest) -> EngineResult<EngineHandle>;

    /// Suspend a task.
    async fn pause(&self, handle: &EngineHandle) -> EngineResult<()> {
        let _ = handle;
        Err(EngineError::Unsupported { operation: "pause" })
    }

    /// Resume a suspended task.
    async fn resume(&self, handle: &EngineHandle) -> EngineResult<()> {
        let _ = handle;
        Err(EngineError::Unsupported { operation: "resume" })
    }

    /// Abort a task; no terminal event follows.
    async fn cancel(&self, handle: &EngineHandle) -> EngineResult<()>;

    /// Abort a task and discard its engine-side state.
    async fn remove(&self, handle: &EngineHandle, options: RemoveOptions) -> EngineResult<()>;

    /// Snapshot of one task.
    async fn status(&self, handle: &EngineHandle) -> EngineResult<TaskSnapshot>;

    /// Snapshots of every live task.
    async fn list(&self) -> EngineResult<Vec<TaskSnapshot>>;

    /// Apply new settings.
    async fn configure(&self, settings: &EngineSettings) -> EngineResult<()> {
        let _ = settings;
        Err(EngineError::Unsupported {
            operation: "configure",
        })
    }

    /// Engine version string.
    async fn version(&self) -> EngineResult<String>;
}
