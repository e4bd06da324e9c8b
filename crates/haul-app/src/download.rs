//! Download orchestration.
//!
//! # Design
//! - Caller operations and engine events both write through the [`TaskLedger`],
//!   so status and handle fields are never mutated by two parties at once.
//! - Progress is published but not persisted; completion and failure are.
//! - A terminal event that arrives before its submission has stored the handle
//!   is parked and replayed once the handle lands.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use haul_core::{
    EngineError, EngineEvent, EngineEventKind, EngineEventReceiver, EngineHandle,
    ProgressSample, RemoveOptions, Resolved, SourceKind, SubmitOptions, SubmitRequest, TaskEngine,
    TaskFilter, TaskRecord, TaskSource, TaskStatus, TransitionError, UrlResolver,
    validate_transition,
};
use haul_events::Event;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ledger::TaskLedger;
use crate::publish::Publisher;

const PARKED_LIMIT: usize = 64;

/// Request to create a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTask {
    /// URL, magnet link, or base64 torrent blob as submitted.
    pub url: String,
    /// Filename override; the resolver's suggestion applies when absent.
    pub filename: Option<String>,
    /// Remote upload destination; `None` disables auto-upload.
    pub destination: Option<String>,
    /// Headers the fetch must carry.
    pub headers: BTreeMap<String, String>,
    /// Local directory override.
    pub directory: Option<PathBuf>,
    /// Torrent file indices to fetch; empty means all.
    pub selected_files: Vec<usize>,
    /// Speed cap in bytes per second.
    pub max_download_speed: Option<u64>,
    /// Connection cap per server.
    pub max_connections: Option<u32>,
}

impl NewTask {
    /// Task for `url` with defaults for everything else.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Upload the payload to `destination` once downloaded.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Owns task records through their download phase.
pub struct DownloadService {
    ledger: Arc<TaskLedger>,
    engine: Arc<dyn TaskEngine>,
    resolver: Arc<dyn UrlResolver>,
    publisher: Publisher,
    live: Mutex<HashMap<Uuid, ProgressSample>>,
    parked: AsyncMutex<VecDeque<EngineEvent>>,
}

impl DownloadService {
    /// Service writing through `ledger` and submitting to `engine`.
    #[must_use]
    pub fn new(
        ledger: Arc<TaskLedger>,
        engine: Arc<dyn TaskEngine>,
        resolver: Arc<dyn UrlResolver>,
        publisher: Publisher,
    ) -> Self {
        Self {
            ledger,
            engine,
            resolver,
            publisher,
            live: Mutex::new(HashMap::new()),
            parked: AsyncMutex::new(VecDeque::new()),
        }
    }

    /// Shared ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    /// Resolve `task.url`, persist a `Waiting` record, and submit it.
    ///
    /// # Errors
    ///
    /// Fails when the URL cannot be classified or resolved (no record is
    /// written) or when the engine rejects the submission (the record is left
    /// in `Error`).
    pub async fn create(&self, task: NewTask) -> AppResult<TaskRecord> {
        let source =
            TaskSource::classify(&task.url).map_err(|err| AppError::engine("classify", err))?;
        let resolved = match &source {
            TaskSource::Url { url } => self.resolver.resolve(url, &task.headers).await?,
            TaskSource::Magnet { .. } | TaskSource::Metainfo { .. } => Resolved {
                url: source.to_url(),
                filename: torrent_name(&source),
                size: None,
                headers: task.headers.clone(),
            },
        };

        let filename = task
            .filename
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(resolved.filename);
        let mut record = TaskRecord::new(task.url, filename);
        record.resolved_url = resolved.url;
        record.total_bytes = resolved.size.unwrap_or(0);
        record.headers = resolved.headers;
        record.destination = task.destination.filter(|dest| !dest.trim().is_empty());
        record.transition(TaskStatus::Waiting)?;
        self.ledger.create(&record).await?;
        info!(task_id = %record.id, filename = %record.filename, "task created");

        let mut options = options_for(&record);
        options.directory = task.directory;
        options.selected_files = task.selected_files;
        options.max_download_speed = task.max_download_speed;
        options.max_connections = task.max_connections;
        self.launch(record.id, options, true).await
    }

    /// Suspend a task.
    ///
    /// # Errors
    ///
    /// Fails when the transition is illegal or the engine refuses; the record
    /// is not touched in either case.
    pub async fn pause(&self, id: Uuid) -> AppResult<TaskRecord> {
        let guard = self.ledger.lock(id).await;
        let mut record = guard.load().await?;
        if record.status == TaskStatus::Paused {
            return Ok(record);
        }
        validate_transition(record.status, TaskStatus::Paused)?;
        if let Some(handle) = record.engine_id.as_deref() {
            self.engine
                .pause(&EngineHandle::new(handle))
                .await
                .map_err(|err| AppError::engine("pause", err))?;
        }
        let from = record.status;
        record.transition(TaskStatus::Paused)?;
        record.speed = 0;
        record.eta_seconds = None;
        guard.save(&mut record).await?;
        drop(guard);

        self.forget_progress(id);
        self.status_changed(id, from, TaskStatus::Paused);
        info!(task_id = %id, "task paused");
        Ok(record)
    }

    /// Resume a paused task, requeueing it when its engine no longer knows the
    /// handle.
    ///
    /// # Errors
    ///
    /// Fails when the task is not paused or the engine refuses.
    pub async fn resume(&self, id: Uuid) -> AppResult<TaskRecord> {
        let guard = self.ledger.lock(id).await;
        let mut record = guard.load().await?;
        if record.status == TaskStatus::Active {
            return Ok(record);
        }
        if record.status != TaskStatus::Paused {
            return Err(AppError::InvalidState {
                id,
                operation: "resume",
                status: record.status,
            });
        }
        if let Some(handle) = record.engine_id.as_deref() {
            match self.engine.resume(&EngineHandle::new(handle)).await {
                Ok(()) => {
                    record.transition(TaskStatus::Active)?;
                    guard.save(&mut record).await?;
                    drop(guard);
                    self.status_changed(id, TaskStatus::Paused, TaskStatus::Active);
                    info!(task_id = %id, "task resumed");
                    return Ok(record);
                }
                Err(EngineError::UnknownHandle { .. }) => {
                    info!(task_id = %id, handle, "engine lost the paused task; requeueing");
                }
                Err(err) => return Err(AppError::engine("resume", err)),
            }
        }
        record.clear_handle();
        record.transition(TaskStatus::Waiting)?;
        guard.save(&mut record).await?;
        drop(guard);
        self.status_changed(id, TaskStatus::Paused, TaskStatus::Waiting);
        self.launch(id, options_for(&record), false).await
    }

    /// Remove the engine task (deleting its files when asked) and the record.
    ///
    /// # Errors
    ///
    /// Fails when the record does not exist or cannot be deleted.
    pub async fn delete(&self, id: Uuid, delete_files: bool) -> AppResult<()> {
        let guard = self.ledger.lock(id).await;
        let record = guard.load().await?;
        match record.engine_id.as_deref() {
            Some(handle) => {
                let handle = EngineHandle::new(handle);
                match self.engine.remove(&handle, RemoveOptions { delete_files }).await {
                    Ok(()) | Err(EngineError::UnknownHandle { .. }) => {}
                    Err(err) => {
                        warn!(task_id = %id, handle = %handle, detail = %err.detail(), "engine failed to remove task");
                    }
                }
            }
            None if delete_files => {
                if let Some(path) = record.local_path.as_deref() {
                    remove_payload(Path::new(path)).await;
                }
            }
            None => {}
        }
        guard.delete().await?;

        self.forget_progress(id);
        self.publisher.publish(Event::TaskRemoved { task_id: id });
        info!(task_id = %id, delete_files, "task deleted");
        Ok(())
    }

    /// Record with the latest unpersisted progress applied.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when absent.
    pub async fn get(&self, id: Uuid) -> AppResult<TaskRecord> {
        let mut record = self.ledger.get(id).await?;
        self.overlay(&mut record);
        Ok(record)
    }

    /// Records matching `filter`, with live progress applied.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository fails.
    pub async fn list(&self, filter: &TaskFilter) -> AppResult<Vec<TaskRecord>> {
        let mut records = self.ledger.list(filter).await?;
        for record in &mut records {
            self.overlay(record);
        }
        Ok(records)
    }

    /// Send a failed or finished task through the download phase again.
    ///
    /// # Errors
    ///
    /// Fails when the task is neither `Error` nor `Complete`, or when the
    /// resubmission is rejected.
    pub async fn retry(&self, id: Uuid) -> AppResult<TaskRecord> {
        let guard = self.ledger.lock(id).await;
        let mut record = guard.load().await?;
        if !matches!(record.status, TaskStatus::Error | TaskStatus::Complete) {
            return Err(AppError::InvalidState {
                id,
                operation: "retry",
                status: record.status,
            });
        }
        let from = record.status;
        record.transition(TaskStatus::Waiting)?;
        record.clear_handle();
        record.downloaded_bytes = 0;
        record.local_path = None;
        record.upload_job = None;
        guard.save(&mut record).await?;
        drop(guard);

        self.status_changed(id, from, TaskStatus::Waiting);
        info!(task_id = %id, "retrying task");
        self.launch(id, options_for(&record), false).await
    }

    /// Submit every `Waiting` record that has no handle. Returns how many
    /// were accepted.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository cannot be listed; individual
    /// submission failures are logged and left in `Error`.
    pub async fn requeue_waiting(&self) -> AppResult<usize> {
        let filter = TaskFilter {
            statuses: vec![TaskStatus::Waiting],
            has_handle: Some(false),
        };
        let mut launched = 0;
        for record in self.ledger.list(&filter).await? {
            match self.launch(record.id, options_for(&record), false).await {
                Ok(_) => launched += 1,
                Err(err) => {
                    warn!(task_id = %record.id, detail = %err.detail(), "requeue failed");
                }
            }
        }
        if launched > 0 {
            info!(launched, "requeued waiting tasks");
        }
        Ok(launched)
    }

    /// Reset in-flight records whose handle the engine no longer reports.
    /// Returns how many were reset to `Waiting`.
    ///
    /// # Errors
    ///
    /// Fails when the engine cannot list its tasks or the repository fails.
    pub async fn sync(&self) -> AppResult<usize> {
        let live: HashSet<String> = self
            .engine
            .list()
            .await
            .map_err(|err| AppError::engine("list", err))?
            .into_iter()
            .map(|snapshot| snapshot.handle.to_string())
            .collect();
        let filter = TaskFilter {
            statuses: TaskStatus::ALL
                .into_iter()
                .filter(|status| status.is_in_flight())
                .collect(),
            has_handle: Some(true),
        };

        let mut reset = 0;
        for stale in self.ledger.list(&filter).await? {
            if stale.engine_id.as_ref().is_none_or(|handle| live.contains(handle)) {
                continue;
            }
            let guard = self.ledger.lock(stale.id).await;
            let mut record = guard.load().await?;
            if record.engine_id != stale.engine_id || !record.status.is_in_flight() {
                continue;
            }
            let from = record.status;
            record.clear_handle();
            record.transition(TaskStatus::Waiting)?;
            guard.save(&mut record).await?;
            drop(guard);

            if from != TaskStatus::Waiting {
                self.status_changed(record.id, from, TaskStatus::Waiting);
            }
            info!(task_id = %record.id, handle = ?stale.engine_id, "reset task lost by its engine");
            reset += 1;
        }
        Ok(reset)
    }

    /// Consume engine events until the channel closes.
    #[must_use]
    pub fn spawn_event_pump(self: &Arc<Self>, mut receiver: EngineEventReceiver) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let handle = event.handle.clone();
                if let Err(err) = service.on_engine_event(event).await {
                    warn!(handle = %handle, detail = %err.detail(), "engine event not applied");
                }
            }
            debug!("engine event channel closed");
        })
    }

    async fn on_engine_event(&self, event: EngineEvent) -> AppResult<()> {
        if let EngineEventKind::Progress(sample) = &event.kind {
            let Some(record) = self.ledger.find_by_handle(event.handle.as_str()).await? else {
                trace!(handle = %event.handle, "progress for unknown handle");
                return Ok(());
            };
            self.record_progress(record.id, sample);
            return Ok(());
        }

        let record = {
            let mut parked = self.parked.lock().await;
            let found = self.ledger.find_by_handle(event.handle.as_str()).await?;
            let Some(record) = found else {
                debug!(handle = %event.handle, "parking terminal event for unknown handle");
                if parked.len() >= PARKED_LIMIT {
                    parked.pop_front();
                }
                parked.push_back(event);
                return Ok(());
            };
            record
        };
        self.apply_terminal(record.id, event).await
    }

    async fn apply_terminal(&self, id: Uuid, event: EngineEvent) -> AppResult<()> {
        let guard = self.ledger.lock(id).await;
        let mut record = guard.load().await?;
        if record.engine_id.as_deref() != Some(event.handle.as_str()) {
            debug!(task_id = %id, handle = %event.handle, "ignoring event for a replaced handle");
            return Ok(());
        }
        let last = self.forget_progress(id);

        match event.kind {
            EngineEventKind::Completed { path } => {
                settle(&mut record, TaskStatus::Complete)?;
                if let Some(last) = last {
                    record.total_bytes = record.total_bytes.max(last.total);
                    record.downloaded_bytes = last.downloaded;
                }
                if record.total_bytes > 0 {
                    record.downloaded_bytes = record.total_bytes;
                }
                record.speed = 0;
                record.eta_seconds = None;
                record.local_path = Some(path.display().to_string());
                let uploads = record.wants_upload();
                if !uploads {
                    record.clear_handle();
                }
                guard.save(&mut record).await?;
                drop(guard);

                self.publisher.publish(Event::TaskCompleted {
                    task_id: id,
                    path: path.display().to_string(),
                    status: TaskStatus::Complete,
                });
                info!(task_id = %id, path = %path.display(), uploads, "download complete");
            }
            EngineEventKind::Failed { message } => {
                settle(&mut record, TaskStatus::Error)?;
                record.error = Some(message.clone());
                record.clear_handle();
                guard.save(&mut record).await?;
                drop(guard);

                self.publisher.metrics().inc_failure("download");
                self.publisher.publish(Event::TaskFailed {
                    task_id: id,
                    message: message.clone(),
                });
                warn!(task_id = %id, error = %message, "download failed");
            }
            EngineEventKind::Progress(_) => return Ok(()),
        }
        self.release(&event.handle).await;
        Ok(())
    }

    async fn launch(&self, id: Uuid, options: SubmitOptions, fresh: bool) -> AppResult<TaskRecord> {
        let guard = self.ledger.lock(id).await;
        let mut record = guard.load().await?;
        if record.status != TaskStatus::Waiting || record.engine_id.is_some() {
            return Err(AppError::InvalidState {
                id,
                operation: "submit",
                status: record.status,
            });
        }
        let source = TaskSource::classify(&record.resolved_url)
            .map_err(|err| AppError::engine("classify", err))?;

        let handle = match self.engine.submit(SubmitRequest { source, options }).await {
            Ok(handle) => handle,
            Err(err) => {
                let detail = err.detail();
                record.transition(TaskStatus::Error)?;
                record.error = Some(detail.clone());
                guard.save(&mut record).await?;
                drop(guard);

                self.publisher.metrics().inc_failure("submit");
                self.publisher.publish(Event::TaskFailed {
                    task_id: id,
                    message: detail.clone(),
                });
                warn!(task_id = %id, error = %detail, "submission failed");
                return Err(AppError::engine("submit", err));
            }
        };

        let backend = self.engine.backend_of(&handle);
        record.engine_id = Some(handle.to_string());
        record.backend = Some(backend);
        record.error = None;
        record.transition(TaskStatus::Active)?;
        self.publisher.metrics().inc_submitted(backend.as_str());
        if fresh {
            self.publisher.publish(Event::TaskCreated {
                task_id: id,
                filename: record.filename.clone(),
                backend: backend.as_str().to_string(),
            });
        }

        let replay = {
            let mut parked = self.parked.lock().await;
            guard.save(&mut record).await?;
            let (matching, rest): (VecDeque<_>, VecDeque<_>) =
                parked.drain(..).partition(|event| event.handle == handle);
            *parked = rest;
            matching
        };
        drop(guard);

        self.status_changed(id, TaskStatus::Waiting, TaskStatus::Active);
        info!(task_id = %id, handle = %handle, engine = backend.as_str(), "task submitted");
        for event in replay {
            self.apply_terminal(id, event).await?;
        }
        Ok(record)
    }

    async fn release(&self, handle: &EngineHandle) {
        match self.engine.remove(handle, RemoveOptions::default()).await {
            Ok(()) | Err(EngineError::UnknownHandle { .. }) => {}
            Err(err) => debug!(handle = %handle, detail = %err.detail(), "engine kept finished task"),
        }
    }

    fn progress_table(&self) -> MutexGuard<'_, HashMap<Uuid, ProgressSample>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_progress(&self, id: Uuid, sample: &ProgressSample) {
        let active = {
            let mut live = self.progress_table();
            live.insert(id, sample.clone());
            live.len()
        };
        self.publisher.metrics().set_active_tasks(gauge(active));
        self.publisher.publish(Event::TaskProgress {
            task_id: id,
            downloaded: sample.downloaded,
            total: sample.total,
            speed: sample.speed,
            eta_seconds: sample.eta_seconds,
            files: sample.files.clone(),
        });
    }

    fn forget_progress(&self, id: Uuid) -> Option<ProgressSample> {
        let (last, active) = {
            let mut live = self.progress_table();
            let last = live.remove(&id);
            (last, live.len())
        };
        self.publisher.metrics().set_active_tasks(gauge(active));
        last
    }

    fn overlay(&self, record: &mut TaskRecord) {
        if let Some(sample) = self.progress_table().get(&record.id) {
            record.downloaded_bytes = sample.downloaded;
            if sample.total > 0 {
                record.total_bytes = sample.total;
            }
            record.speed = sample.speed;
            record.eta_seconds = sample.eta_seconds;
        }
    }

    fn status_changed(&self, id: Uuid, from: TaskStatus, to: TaskStatus) {
        self.publisher.publish(Event::TaskStatusChanged {
            task_id: id,
            from,
            to,
        });
    }
}

/// Move to `to`, passing through `Active` when the direct step is not listed.
fn settle(record: &mut TaskRecord, to: TaskStatus) -> Result<(), TransitionError> {
    if record.status != to
        && validate_transition(record.status, to).is_err()
        && validate_transition(record.status, TaskStatus::Active).is_ok()
    {
        record.transition(TaskStatus::Active)?;
    }
    record.transition(to)
}

fn options_for(record: &TaskRecord) -> SubmitOptions {
    let direct = TaskSource::classify(&record.resolved_url)
        .map_or(true, |source| source.kind() == SourceKind::Http);
    SubmitOptions {
        headers: record.headers.clone(),
        filename: direct.then(|| record.filename.clone()),
        ..SubmitOptions::default()
    }
}

fn torrent_name(source: &TaskSource) -> String {
    source
        .magnet_display_name()
        .or_else(|| source.magnet_info_hash())
        .unwrap_or_else(|| "torrent".to_string())
}

fn gauge(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

async fn remove_payload(path: &Path) {
    let removed = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(err) => Err(err),
    };
    match removed {
        Ok(()) => debug!(path = %path.display(), "deleted payload"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to delete payload"),
    }
}
