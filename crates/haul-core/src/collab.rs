//! Narrow seams to the collaborators the orchestrator consumes: URL resolution,
//! cloud-sync transfers, and task persistence.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::TaskStatus;
use crate::error::{CloudSyncError, RepositoryError, ResolveError};
use crate::model::TaskRecord;

/// Outcome of resolving a submitted URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    /// URL to fetch.
    pub url: String,
    /// Suggested filename.
    pub filename: String,
    /// Declared size, when advertised.
    pub size: Option<u64>,
    /// Headers the fetch must carry.
    pub headers: BTreeMap<String, String>,
}

/// Turns a user-supplied URL into something a backend can fetch.
#[async_trait]
pub trait UrlResolver: Send + Sync {
    /// Resolve `url` with the caller-supplied headers.
    async fn resolve(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Resolved, ResolveError>;
}

/// Cloud-sync job handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub String);

impl Display for JobHandle {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Upload request for a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Local file or directory to upload.
    pub local_path: PathBuf,
    /// Remote destination (`remote:path`).
    pub destination: String,
    /// Move instead of copy.
    pub delete_source: bool,
}

/// Coarse job state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Still transferring.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed {
        /// Backend error text.
        message: String,
    },
}

/// Job status sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    /// Coarse state.
    pub state: JobState,
    /// Bytes transferred.
    pub transferred: u64,
    /// Total bytes to transfer.
    pub total: u64,
    /// Throughput in bytes per second.
    pub speed: u64,
}

/// Per-transfer network settings for copy-by-URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferConfig {
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Proxy URL.
    pub proxy: Option<String>,
    /// Parallel streams.
    pub streams: u32,
    /// Low-level retries.
    pub retries: u32,
    /// Skip TLS certificate verification.
    pub insecure_tls: bool,
    /// User agent override.
    pub user_agent: Option<String>,
}

/// Copy-by-URL request used by the in-process HTTP path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    /// Directory the file lands in.
    pub destination_dir: PathBuf,
    /// Target filename.
    pub filename: String,
    /// Source URL.
    pub source_url: String,
    /// Network settings for this transfer.
    pub transfer: TransferConfig,
}

/// Shared byte counters a running transfer updates and a sampler reads.
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    transferred: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl TransferProgress {
    /// Record the latest counters.
    pub fn record(&self, transferred: u64, total: u64) {
        self.transferred.store(transferred, Ordering::Relaxed);
        if total > 0 {
            self.total.store(total, Ordering::Relaxed);
        }
    }

    /// Read `(transferred, total)`.
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.transferred.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

/// Cloud-sync capability.
#[async_trait]
pub trait CloudSync: Send + Sync {
    /// Start an upload job.
    async fn upload_job(&self, request: &UploadRequest) -> Result<JobHandle, CloudSyncError>;

    /// Current status of a job.
    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus, CloudSyncError>;

    /// Stop a running job.
    async fn cancel_job(&self, job: &JobHandle) -> Result<(), CloudSyncError>;

    /// Fetch `request.source_url` into the destination directory, updating
    /// `progress` as bytes arrive. Returns the final path.
    ///
    /// Implementations must return `CloudSyncError::Cancelled` once `cancel`
    /// fires.
    async fn copy_by_url(
        &self,
        request: &CopyRequest,
        progress: &TransferProgress,
        cancel: CancellationToken,
    ) -> Result<PathBuf, CloudSyncError>;
}

/// Record filter for repository listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only these statuses; empty matches all.
    pub statuses: Vec<TaskStatus>,
    /// Require the presence (or absence) of an engine handle.
    pub has_handle: Option<bool>,
}

impl TaskFilter {
    /// Filter for a set of statuses.
    #[must_use]
    pub fn with_statuses(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            has_handle: None,
        }
    }

    /// Whether `record` passes this filter.
    #[must_use]
    pub fn matches(&self, record: &TaskRecord) -> bool {
        let status_ok = self.statuses.is_empty() || self.statuses.contains(&record.status);
        let handle_ok = self
            .has_handle
            .is_none_or(|want| record.engine_id.is_some() == want);
        status_ok && handle_ok
    }
}

/// Persistence seam for task records.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new record.
    async fn create(&self, record: &TaskRecord) -> Result<(), RepositoryError>;

    /// Fetch by identifier.
    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, RepositoryError>;

    /// Fetch by engine handle.
    async fn get_by_handle(&self, handle: &str) -> Result<Option<TaskRecord>, RepositoryError>;

    /// List records matching `filter`, oldest first.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, RepositoryError>;

    /// Replace a record in full.
    async fn update(&self, record: &TaskRecord) -> Result<(), RepositoryError>;

    /// Delete a record.
    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError>;
}
