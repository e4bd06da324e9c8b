//! Fake engines and collaborators for orchestration tests.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use haul_core::{
    Backend, CloudSync, CloudSyncError, CopyRequest, EngineError, EngineEvents, EngineHandle,
    EngineResult, EngineSettings, JobHandle, JobState, JobStatus, ProgressSample, RemoveOptions,
    ResolveError, Resolved, SubmitRequest, TaskEngine, TaskSnapshot, TaskStatus, TransferProgress,
    UploadRequest, UrlResolver,
};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// What a [`RecordingEngine`] does after accepting a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Keep the task active until told otherwise.
    Hold,
    /// Report progress, then complete into the given directory.
    Complete {
        /// Directory the payload "lands" in.
        dir: PathBuf,
        /// Total bytes reported.
        total: u64,
    },
    /// Report progress, then fail with the message.
    Fail {
        /// Failure detail.
        message: String,
    },
}

/// Engine double that records every call and emits scripted events.
pub struct RecordingEngine {
    backend: Backend,
    events: EngineEvents,
    prefix: &'static str,
    counter: AtomicU64,
    script: RwLock<Script>,
    submit_failure: RwLock<Option<String>>,
    live: RwLock<BTreeMap<EngineHandle, TaskSnapshot>>,
    /// Accepted submissions.
    pub submitted: RwLock<Vec<SubmitRequest>>,
    /// Paused handles.
    pub paused: RwLock<Vec<EngineHandle>>,
    /// Resumed handles.
    pub resumed: RwLock<Vec<EngineHandle>>,
    /// Cancelled handles.
    pub cancelled: RwLock<Vec<EngineHandle>>,
    /// Removed handles with their options.
    pub removed: RwLock<Vec<(EngineHandle, RemoveOptions)>>,
    /// Settings pushed through `configure`.
    pub configured: RwLock<Vec<EngineSettings>>,
    /// Number of `start` calls.
    pub starts: AtomicU64,
    /// Number of `stop` calls.
    pub stops: AtomicU64,
}

impl RecordingEngine {
    /// Engine that holds every task active.
    #[must_use]
    pub fn new(backend: Backend, events: EngineEvents) -> Self {
        let prefix = match backend {
            Backend::Remote => "remote",
            Backend::InProcess => "inproc",
        };
        Self {
            backend,
            events,
            prefix,
            counter: AtomicU64::new(1),
            script: RwLock::new(Script::Hold),
            submit_failure: RwLock::new(None),
            live: RwLock::new(BTreeMap::new()),
            submitted: RwLock::new(Vec::new()),
            paused: RwLock::new(Vec::new()),
            resumed: RwLock::new(Vec::new()),
            cancelled: RwLock::new(Vec::new()),
            removed: RwLock::new(Vec::new()),
            configured: RwLock::new(Vec::new()),
            starts: AtomicU64::new(0),
            stops: AtomicU64::new(0),
        }
    }

    /// Change what happens after the next submissions.
    pub async fn set_script(&self, script: Script) {
        *self.script.write().await = script;
    }

    /// Make every following `submit` fail with `message`.
    pub async fn fail_submissions(&self, message: impl Into<String>) {
        *self.submit_failure.write().await = Some(message.into());
    }

    /// Drop a handle from the live set, as if the backend lost it.
    pub async fn forget(&self, handle: &EngineHandle) {
        self.live.write().await.remove(handle);
    }

    /// Total single-task calls (pause, resume, cancel, remove) received.
    pub async fn task_calls(&self) -> usize {
        self.paused.read().await.len()
            + self.resumed.read().await.len()
            + self.cancelled.read().await.len()
            + self.removed.read().await.len()
    }

    /// Emit a progress event for `handle`.
    pub fn emit_progress(&self, handle: &EngineHandle, downloaded: u64, total: u64) {
        self.events.progress(
            handle,
            ProgressSample {
                downloaded,
                total,
                speed: downloaded,
                eta_seconds: haul_core::eta_seconds(downloaded, total, downloaded),
                files: Vec::new(),
            },
        );
    }

    async fn run_script(&self, handle: EngineHandle, filename: String) {
        let script = self.script.read().await.clone();
        let events = self.events.clone();
        match script {
            Script::Hold => {}
            Script::Complete { dir, total } => {
                tokio::spawn(async move {
                    sleep(Duration::from_millis(5)).await;
                    events.progress(
                        &handle,
                        ProgressSample {
                            downloaded: total / 2,
                            total,
                            speed: total / 2,
                            eta_seconds: Some(1),
                            files: Vec::new(),
                        },
                    );
                    sleep(Duration::from_millis(5)).await;
                    events.completed(&handle, dir.join(filename));
                });
            }
            Script::Fail { message } => {
                tokio::spawn(async move {
                    sleep(Duration::from_millis(5)).await;
                    events.failed(&handle, message);
                });
            }
        }
    }

    async fn ensure_live(&self, handle: &EngineHandle) -> EngineResult<()> {
        if self.live.read().await.contains_key(handle) {
            Ok(())
        } else {
            Err(EngineError::UnknownHandle {
                handle: handle.to_string(),
            })
        }
    }
}

#[async_trait]
impl TaskEngine for RecordingEngine {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn start(&self) -> EngineResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.live.write().await.clear();
        Ok(())
    }

    async fn submit(&self, request: SubmitRequest) -> EngineResult<EngineHandle> {
        if let Some(message) = self.submit_failure.read().await.clone() {
            return Err(EngineError::Rejected {
                operation: "submit",
                message,
            });
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = EngineHandle::new(format!("{}-{n}", self.prefix));
        let filename = request
            .options
            .filename
            .clone()
            .unwrap_or_else(|| "payload.bin".to_string());
        let mut snapshot = TaskSnapshot::new(handle.clone(), self.backend, TaskStatus::Active);
        snapshot.name = Some(filename.clone());
        self.live.write().await.insert(handle.clone(), snapshot);
        self.submitted.write().await.push(request);
        self.run_script(handle.clone(), filename).await;
        Ok(handle)
    }

    async fn pause(&self, handle: &EngineHandle) -> EngineResult<()> {
        self.ensure_live(handle).await?;
        self.paused.write().await.push(handle.clone());
        Ok(())
    }

    async fn resume(&self, handle: &EngineHandle) -> EngineResult<()> {
        self.ensure_live(handle).await?;
        self.resumed.write().await.push(handle.clone());
        Ok(())
    }

    async fn cancel(&self, handle: &EngineHandle) -> EngineResult<()> {
        self.cancelled.write().await.push(handle.clone());
        self.live.write().await.remove(handle);
        Ok(())
    }

    async fn remove(&self, handle: &EngineHandle, options: RemoveOptions) -> EngineResult<()> {
        self.removed.write().await.push((handle.clone(), options));
        self.live.write().await.remove(handle);
        Ok(())
    }

    async fn status(&self, handle: &EngineHandle) -> EngineResult<TaskSnapshot> {
        self.live
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandle {
                handle: handle.to_string(),
            })
    }

    async fn list(&self) -> EngineResult<Vec<TaskSnapshot>> {
        Ok(self.live.read().await.values().cloned().collect())
    }

    async fn configure(&self, settings: &EngineSettings) -> EngineResult<()> {
        self.configured.write().await.push(settings.clone());
        Ok(())
    }

    async fn version(&self) -> EngineResult<String> {
        Ok(format!("recording-{}", self.prefix))
    }
}

/// Cloud-sync double. Upload jobs succeed after `polls_to_finish` status calls.
pub struct MockCloudSync {
    counter: AtomicU64,
    polls_to_finish: u64,
    polls: RwLock<HashMap<JobHandle, u64>>,
    job_failure: RwLock<Option<String>>,
    submit_failure: RwLock<Option<String>>,
    copy_failure: RwLock<Option<String>>,
    copy_delay: RwLock<Duration>,
    upload_delay: RwLock<Duration>,
    /// Upload requests received.
    pub uploads: RwLock<Vec<UploadRequest>>,
    /// Copy-by-URL requests received.
    pub copies: RwLock<Vec<CopyRequest>>,
    /// Cancelled jobs.
    pub cancelled: RwLock<Vec<JobHandle>>,
}

impl Default for MockCloudSync {
    fn default() -> Self {
        Self::new(2)
    }
}

impl MockCloudSync {
    /// Jobs report `Running` for `polls_to_finish - 1` polls, then finish.
    #[must_use]
    pub fn new(polls_to_finish: u64) -> Self {
        Self {
            counter: AtomicU64::new(1),
            polls_to_finish: polls_to_finish.max(1),
            polls: RwLock::new(HashMap::new()),
            job_failure: RwLock::new(None),
            submit_failure: RwLock::new(None),
            copy_failure: RwLock::new(None),
            copy_delay: RwLock::new(Duration::from_millis(20)),
            upload_delay: RwLock::new(Duration::ZERO),
            uploads: RwLock::new(Vec::new()),
            copies: RwLock::new(Vec::new()),
            cancelled: RwLock::new(Vec::new()),
        }
    }

    /// Finished jobs report this failure instead of success.
    pub async fn fail_jobs(&self, message: impl Into<String>) {
        *self.job_failure.write().await = Some(message.into());
    }

    /// `upload_job` is rejected with this message.
    pub async fn reject_uploads(&self, message: impl Into<String>) {
        *self.submit_failure.write().await = Some(message.into());
    }

    /// `copy_by_url` fails with this message.
    pub async fn fail_copies(&self, message: impl Into<String>) {
        *self.copy_failure.write().await = Some(message.into());
    }

    /// How long a copy takes before it returns.
    pub async fn set_copy_delay(&self, delay: Duration) {
        *self.copy_delay.write().await = delay;
    }

    /// `upload_job` takes this long to answer.
    pub async fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.write().await = delay;
    }
}

#[async_trait]
impl CloudSync for MockCloudSync {
    async fn upload_job(&self, request: &UploadRequest) -> Result<JobHandle, CloudSyncError> {
        if let Some(message) = self.submit_failure.read().await.clone() {
            return Err(CloudSyncError::Remote {
                operation: "upload",
                message,
            });
        }
        let delay = *self.upload_delay.read().await;
        if !delay.is_zero() {
            sleep(delay).await;
        }
        self.uploads.write().await.push(request.clone());
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(JobHandle(id.to_string()))
    }

    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus, CloudSyncError> {
        let polls = {
            let mut polls = self.polls.write().await;
            let entry = polls.entry(job.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let total = 1_000;
        if polls < self.polls_to_finish {
            return Ok(JobStatus {
                state: JobState::Running,
                transferred: total / 2,
                total,
                speed: 100,
            });
        }
        let state = match self.job_failure.read().await.clone() {
            Some(message) => JobState::Failed { message },
            None => JobState::Succeeded,
        };
        Ok(JobStatus {
            state,
            transferred: total,
            total,
            speed: 0,
        })
    }

    async fn cancel_job(&self, job: &JobHandle) -> Result<(), CloudSyncError> {
        self.cancelled.write().await.push(job.clone());
        Ok(())
    }

    async fn copy_by_url(
        &self,
        request: &CopyRequest,
        progress: &TransferProgress,
        cancel: CancellationToken,
    ) -> Result<PathBuf, CloudSyncError> {
        self.copies.write().await.push(request.clone());
        let delay = *self.copy_delay.read().await;
        progress.record(512, 1_024);
        tokio::select! {
            () = cancel.cancelled() => return Err(CloudSyncError::Cancelled),
            () = sleep(delay) => {}
        }
        if let Some(message) = self.copy_failure.read().await.clone() {
            return Err(CloudSyncError::Remote {
                operation: "copyurl",
                message,
            });
        }
        progress.record(1_024, 1_024);
        Ok(request.destination_dir.join(&request.filename))
    }
}

/// Resolver double that echoes the URL and derives a filename from it.
#[derive(Default)]
pub struct StaticResolver {
    failure: RwLock<Option<String>>,
    size: Option<u64>,
}

impl StaticResolver {
    /// Resolver reporting `size` for every URL.
    #[must_use]
    pub fn with_size(size: u64) -> Self {
        Self {
            failure: RwLock::new(None),
            size: Some(size),
        }
    }

    /// Fail every resolution with an error status.
    pub async fn fail_with(&self, message: impl Into<String>) {
        *self.failure.write().await = Some(message.into());
    }
}

#[async_trait]
impl UrlResolver for StaticResolver {
    async fn resolve(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Resolved, ResolveError> {
        if self.failure.read().await.is_some() {
            return Err(ResolveError::Status {
                url: url.to_string(),
                status: 404,
            });
        }
        let filename = url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .filter(|segment| !segment.is_empty())
            .unwrap_or("download")
            .to_string();
        Ok(Resolved {
            url: url.to_string(),
            filename,
            size: self.size,
            headers: headers.clone(),
        })
    }
}
