//! [`TaskEngine`] that runs BitTorrent and HTTP transfers inside the process.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use haul_core::{
    Backend, CloudSync, CopyRequest, EngineError, EngineEventKind, EngineEvents, EngineHandle,
    EngineResult, EngineSettings, RemoveOptions, SubmitOptions, SubmitRequest, TaskEngine,
    TaskSnapshot, TaskSource, TaskStatus, TransferConfig, TransferProgress,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::http::{delete_file, filename_from_url, spawn_transfer, transfer_for};
use crate::session::{TorrentAdd, TorrentKey, TorrentPayload, TorrentSession};
use crate::storage::DynamicStorage;
use crate::torrent::TorrentContext;
use crate::tracker::{Tracked, Tracker, Work};

/// Runtime knobs for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InProcessConfig {
    /// Directory used when a submission names none.
    pub download_dir: PathBuf,
    /// How long a torrent may wait for metadata.
    pub metadata_timeout: Duration,
    /// Sampler cadence.
    pub sample_interval: Duration,
    /// Defaults copied into every HTTP transfer.
    pub transfer: TransferConfig,
    /// Session-wide download cap in bytes per second (zero = unlimited).
    pub download_limit: u64,
}

impl Default for InProcessConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            metadata_timeout: Duration::from_secs(60),
            sample_interval: Duration::from_secs(2),
            transfer: TransferConfig {
                streams: 4,
                retries: 3,
                ..TransferConfig::default()
            },
            download_limit: 0,
        }
    }
}

/// In-process engine.
pub struct InProcessEngine {
    context: TorrentContext,
    cloud: Arc<dyn CloudSync>,
    config: RwLock<InProcessConfig>,
    shutdown: Mutex<CancellationToken>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessEngine {
    /// Build an engine; the sampler starts with [`TaskEngine::start`].
    #[must_use]
    pub fn new(
        session: Arc<dyn TorrentSession>,
        cloud: Arc<dyn CloudSync>,
        storage: Arc<DynamicStorage>,
        events: EngineEvents,
        config: InProcessConfig,
    ) -> Self {
        Self {
            context: TorrentContext {
                session,
                storage,
                tracker: Arc::new(Tracker::new(events)),
                wake: Arc::new(Notify::new()),
            },
            cloud,
            config: RwLock::new(config),
            shutdown: Mutex::new(CancellationToken::new()),
            sampler: Mutex::new(None),
        }
    }

    fn config(&self) -> InProcessConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn submit_torrent(
        &self,
        source: &TaskSource,
        options: &SubmitOptions,
    ) -> EngineResult<EngineHandle> {
        let config = self.config();
        let directory = options
            .directory
            .clone()
            .unwrap_or_else(|| config.download_dir.clone());
        let payload = match source {
            TaskSource::Magnet { uri } => TorrentPayload::Magnet(uri.clone()),
            TaskSource::Metainfo { bytes } => TorrentPayload::Metainfo(bytes.clone()),
            TaskSource::Url { .. } => {
                return Err(EngineError::Internal {
                    operation: "submit torrent",
                    message: "direct url routed to the torrent path".into(),
                });
            }
        };
        let storage = &self.context.storage;
        let info_hash = source.magnet_info_hash();
        let fresh_hash = info_hash
            .as_deref()
            .filter(|hash| !storage.is_registered(hash));
        if let Some(hash) = fresh_hash {
            storage.register(hash, directory.clone());
        }
        let added = self
            .context
            .session
            .add(&TorrentAdd {
                payload,
                info_hash: info_hash.clone(),
                output_dir: directory.clone(),
            })
            .await;
        let key = match added {
            Ok(key) => key,
            Err(err) => {
                if let Some(hash) = fresh_hash {
                    storage.unregister(hash);
                }
                return Err(EngineError::Rejected {
                    operation: "add torrent",
                    message: format!("{err:#}"),
                });
            }
        };
        storage.register(&key.0, directory.clone());

        let handle = EngineHandle::new(key.0.clone());
        let task = Tracked::new(
            Work::Torrent {
                key: key.clone(),
                meta: None,
                selected: options.selected_files.clone(),
            },
            directory,
            source.magnet_display_name(),
            TaskStatus::Resolving,
        );
        let cancel = task.cancel.clone();
        self.context.tracker.lock().insert(handle.clone(), task);
        self.context.spawn_watcher(
            handle.clone(),
            key,
            options.selected_files.clone(),
            config.metadata_timeout,
            cancel,
        );
        self.context.wake.notify_one();
        Ok(handle)
    }

    fn submit_http(&self, url: &str, options: &SubmitOptions) -> EngineHandle {
        let config = self.config();
        let directory = options
            .directory
            .clone()
            .unwrap_or_else(|| config.download_dir.clone());
        let filename = options
            .filename
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| filename_from_url(url));
        let request = CopyRequest {
            destination_dir: directory.clone(),
            filename: filename.clone(),
            source_url: url.to_string(),
            transfer: transfer_for(&config.transfer, &options.headers, options.max_connections),
        };
        let progress = TransferProgress::default();
        let handle = EngineHandle::new(format!("http-{}", Uuid::new_v4().simple()));
        let task = Tracked::new(
            Work::Http {
                request: request.clone(),
                progress: progress.clone(),
            },
            directory,
            Some(filename),
            TaskStatus::Active,
        );
        let cancel = task.cancel.clone();
        self.context.tracker.lock().insert(handle.clone(), task);
        self.start_transfer(handle.clone(), request, progress, cancel);
        handle
    }

    fn start_transfer(
        &self,
        handle: EngineHandle,
        request: CopyRequest,
        progress: TransferProgress,
        cancel: CancellationToken,
    ) {
        spawn_transfer(
            Arc::clone(&self.cloud),
            Arc::clone(&self.context.tracker),
            Arc::clone(&self.context.wake),
            handle,
            request,
            progress,
            cancel,
        );
    }

    fn work_of(&self, handle: &EngineHandle) -> EngineResult<Work> {
        self.context
            .tracker
            .lock()
            .get(handle)
            .map(|task| task.work.clone())
            .ok_or_else(|| unknown(handle))
    }

    fn set_status(&self, handle: &EngineHandle, status: TaskStatus) {
        if let Some(task) = self.context.tracker.lock().get_mut(handle) {
            task.status = status;
        }
    }

    fn spawn_sampler(&self) {
        let mut slot = self.sampler.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let shutdown = {
            let mut token = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };
        let sampler = Sampler {
            context: self.context.clone(),
            interval: self.config().sample_interval,
            shutdown,
        };
        *slot = Some(tokio::spawn(sampler.run()));
    }
}

fn unknown(handle: &EngineHandle) -> EngineError {
    EngineError::UnknownHandle {
        handle: handle.to_string(),
    }
}

fn rejected(operation: &'static str, err: &anyhow::Error) -> EngineError {
    EngineError::Rejected {
        operation,
        message: format!("{err:#}"),
    }
}

#[async_trait]
impl TaskEngine for InProcessEngine {
    fn backend(&self) -> Backend {
        Backend::InProcess
    }

    async fn start(&self) -> EngineResult<()> {
        if let Err(err) = self.context.storage.load().await {
            warn!(error = %format!("{err:#}"), "piece index unreadable; starting empty");
        }
        self.spawn_sampler();
        info!(session = self.context.session.name(), "in-process engine started");
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        let sampler = self
            .sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sampler) = sampler {
            if let Err(err) = sampler.await {
                warn!(error = %err, "in-process sampler ended abnormally");
            }
        }
        for (_, task) in self.context.tracker.drain() {
            if let Work::Torrent { key, .. } = task.work {
                self.context.drop_torrent(&key, false).await;
            }
        }
        if let Err(err) = self.context.storage.flush().await {
            warn!(error = %format!("{err:#}"), "failed to persist piece index");
        }
        info!("in-process engine stopped");
        Ok(())
    }

    async fn submit(&self, request: SubmitRequest) -> EngineResult<EngineHandle> {
        if request.options.max_download_speed.is_some() {
            debug!("per-task speed caps are not applied in-process");
        }
        let kind = request.source.kind();
        let handle = match &request.source {
            TaskSource::Url { url } => self.submit_http(url, &request.options),
            source => self.submit_torrent(source, &request.options).await?,
        };
        info!(handle = %handle, kind = ?kind, "submitted in-process download");
        Ok(handle)
    }

    async fn pause(&self, handle: &EngineHandle) -> EngineResult<()> {
        match self.work_of(handle)? {
            Work::Torrent { key, .. } => {
                self.context
                    .session
                    .pause(&key)
                    .await
                    .map_err(|err| rejected("pause", &err))?;
                self.set_status(handle, TaskStatus::Paused);
            }
            Work::Http { .. } => {
                let mut tasks = self.context.tracker.lock();
                let task = tasks.get_mut(handle).ok_or_else(|| unknown(handle))?;
                if task.status != TaskStatus::Paused {
                    task.cancel.cancel();
                    task.cancel = CancellationToken::new();
                    task.status = TaskStatus::Paused;
                }
            }
        }
        debug!(handle = %handle, "paused in-process download");
        Ok(())
    }

    async fn resume(&self, handle: &EngineHandle) -> EngineResult<()> {
        match self.work_of(handle)? {
            Work::Torrent { key, meta, .. } => {
                self.context
                    .session
                    .resume(&key)
                    .await
                    .map_err(|err| rejected("resume", &err))?;
                let status = if meta.is_some() {
                    TaskStatus::Active
                } else {
                    TaskStatus::Resolving
                };
                self.set_status(handle, status);
                self.context.wake.notify_one();
            }
            Work::Http { request, .. } => {
                let restart = {
                    let mut tasks = self.context.tracker.lock();
                    let task = tasks.get_mut(handle).ok_or_else(|| unknown(handle))?;
                    if task.status == TaskStatus::Paused {
                        let progress = TransferProgress::default();
                        task.work = Work::Http {
                            request: request.clone(),
                            progress: progress.clone(),
                        };
                        task.status = TaskStatus::Active;
                        task.restart_counters();
                        Some((progress, task.cancel.clone()))
                    } else {
                        None
                    }
                };
                if let Some((progress, cancel)) = restart {
                    self.start_transfer(handle.clone(), request, progress, cancel);
                }
            }
        }
        debug!(handle = %handle, "resumed in-process download");
        Ok(())
    }

    async fn cancel(&self, handle: &EngineHandle) -> EngineResult<()> {
        let task = self
            .context
            .tracker
            .take(handle)
            .ok_or_else(|| unknown(handle))?;
        if let Work::Torrent { key, .. } = &task.work {
            self.context.drop_torrent(key, false).await;
        }
        info!(handle = %handle, "cancelled in-process download");
        Ok(())
    }

    async fn remove(&self, handle: &EngineHandle, options: RemoveOptions) -> EngineResult<()> {
        let task = self
            .context
            .tracker
            .take(handle)
            .ok_or_else(|| unknown(handle))?;
        match &task.work {
            Work::Torrent { key, .. } => {
                self.context.drop_torrent(key, options.delete_files).await;
            }
            Work::Http { .. } => {
                if options.delete_files {
                    delete_file(task.payload_path()).await;
                }
            }
        }
        info!(handle = %handle, delete_files = options.delete_files, "removed in-process download");
        Ok(())
    }

    async fn status(&self, handle: &EngineHandle) -> EngineResult<TaskSnapshot> {
        self.context
            .tracker
            .lock()
            .get(handle)
            .map(|task| task.snapshot(handle))
            .ok_or_else(|| unknown(handle))
    }

    async fn list(&self) -> EngineResult<Vec<TaskSnapshot>> {
        Ok(self
            .context
            .tracker
            .lock()
            .iter()
            .map(|(handle, task)| task.snapshot(handle))
            .collect())
    }

    async fn configure(&self, settings: &EngineSettings) -> EngineResult<()> {
        {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            config.download_dir.clone_from(&settings.download_dir);
            config.metadata_timeout = settings.metadata_timeout;
            config.download_limit = settings.download_limit;
            config.transfer.streams = settings.http_streams;
            config.transfer.retries = settings.http_retries;
            config.transfer.proxy.clone_from(&settings.proxy);
            config.transfer.insecure_tls = settings.insecure_tls;
            config.transfer.user_agent.clone_from(&settings.user_agent);
        }
        self.context
            .storage
            .set_default_dir(settings.download_dir.clone());
        self.context
            .session
            .set_download_limit(settings.download_limit)
            .await
            .map_err(|err| rejected("configure", &err))?;
        debug!(dir = %settings.download_dir.display(), "applied in-process settings");
        Ok(())
    }

    async fn version(&self) -> EngineResult<String> {
        Ok(format!(
            "haul-inproc {} ({})",
            env!("CARGO_PKG_VERSION"),
            self.context.session.name()
        ))
    }
}

/// Periodic throughput sampler; parks while no task is tracked.
struct Sampler {
    context: TorrentContext,
    interval: Duration,
    shutdown: CancellationToken,
}

impl Sampler {
    async fn run(self) {
        loop {
            if self.context.tracker.is_empty() {
                tokio::select! {
                    () = self.shutdown.cancelled() => break,
                    () = self.context.wake.notified() => continue,
                }
            }
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
            self.tick().await;
        }
        debug!("in-process sampler exited");
    }

    async fn tick(&self) {
        let now = Instant::now();
        let mut finished: Vec<(EngineHandle, TorrentKey, PathBuf)> = Vec::new();
        {
            let mut tasks = self.context.tracker.lock();
            for (handle, task) in tasks.iter_mut() {
                let (downloaded, total, stats) = match &task.work {
                    Work::Torrent { key, .. } => {
                        let Some(stats) = self.context.session.stats(key) else {
                            continue;
                        };
                        self.context.storage.mark_pieces(&key.0, &stats.new_pieces);
                        (stats.downloaded, stats.total, Some(stats))
                    }
                    Work::Http { progress, .. } => {
                        let (downloaded, total) = progress.snapshot();
                        (downloaded, total, None)
                    }
                };
                task.observe(downloaded, total, now);
                if let Some(stats) = &stats {
                    task.observe_files(stats);
                }
                if task.is_complete() {
                    if let Work::Torrent { key, .. } = &task.work {
                        finished.push((handle.clone(), key.clone(), task.payload_path()));
                    }
                    continue;
                }
                trace!(handle = %handle, downloaded, total, "sampled task");
                self.context.tracker.events().progress(handle, task.sample());
            }
        }
        for (handle, key, path) in finished {
            let completed = self
                .context
                .tracker
                .finish(&handle, EngineEventKind::Completed { path: path.clone() });
            if completed.is_some() {
                info!(handle = %handle, path = %path.display(), "torrent download completed");
                self.context.drop_torrent(&key, false).await;
            }
        }
        if let Err(err) = self.context.storage.flush().await {
            warn!(error = %format!("{err:#}"), "failed to persist piece index");
        }
    }
}
