//! [`TaskEngine`] implementation backed by the aria2 daemon.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use haul_core::{
    Backend, EngineError, EngineEvents, EngineHandle, EngineResult, EngineSettings, RemoveOptions,
    SubmitRequest, TaskEngine, TaskSnapshot, TaskSource,
};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::lock;
use crate::options::{download_options, global_options};
use crate::process::{Daemon, LaunchConfig};
use crate::rpc::{Aria2Rpc, call_as};
use crate::sampler::{DaemonLists, PollLoop, SamplerState};
use crate::types::{DownloadStatus, STATUS_KEYS, VersionInfo};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Runtime knobs for the engine.
#[derive(Debug, Clone)]
pub struct Aria2Config {
    /// Poll cadence of the sampler.
    pub poll_interval: Duration,
    /// How long `start` waits for `aria2.getVersion` to answer.
    pub ready_timeout: Duration,
    /// Spawn the daemon locally when set.
    pub launch: Option<LaunchConfig>,
}

impl Default for Aria2Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(5),
            launch: None,
        }
    }
}

/// Remote-process engine.
pub struct Aria2Engine {
    rpc: Arc<dyn Aria2Rpc>,
    events: EngineEvents,
    config: Aria2Config,
    state: Arc<Mutex<SamplerState>>,
    wake: Arc<Notify>,
    shutdown: Mutex<CancellationToken>,
    worker: Mutex<Option<JoinHandle<()>>>,
    daemon: tokio::sync::Mutex<Option<Daemon>>,
}

impl Aria2Engine {
    /// Build an engine over `rpc`; nothing is contacted until [`TaskEngine::start`].
    #[must_use]
    pub fn new(rpc: Arc<dyn Aria2Rpc>, events: EngineEvents, config: Aria2Config) -> Self {
        Self {
            rpc,
            events,
            config,
            state: Arc::new(Mutex::new(SamplerState::default())),
            wake: Arc::new(Notify::new()),
            shutdown: Mutex::new(CancellationToken::new()),
            worker: Mutex::new(None),
            daemon: tokio::sync::Mutex::new(None),
        }
    }

    /// Poll `aria2.getVersion` until it answers or the ready timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::NotReady`] once the timeout passes.
    pub async fn wait_ready(&self) -> Result<String, RpcError> {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;
        loop {
            match call_as::<VersionInfo>(self.rpc.as_ref(), "aria2.getVersion", Vec::new()).await {
                Ok(info) => return Ok(info.version),
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        warn!(detail = %err.detail(), "aria2 readiness check gave up");
                        return Err(RpcError::NotReady {
                            waited: self.config.ready_timeout,
                        });
                    }
                    debug!(detail = %err.detail(), "aria2 not ready yet");
                    tokio::time::sleep(READY_POLL_INTERVAL).await;
                    if let Err(err) = self.rpc.reconnect().await {
                        debug!(detail = %err.detail(), "aria2 redial failed");
                    }
                }
            }
        }
    }

    fn gid(&self, handle: &EngineHandle) -> String {
        lock(&self.state).gid_for(handle)
    }

    async fn gid_call(&self, method: &'static str, handle: &EngineHandle) -> Result<Value, RpcError> {
        let gid = self.gid(handle);
        self.rpc.call(method, vec![Value::from(gid)]).await
    }

    fn spawn_sampler(&self) {
        let mut worker = lock(&self.worker);
        if worker.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let shutdown = {
            let mut token = lock(&self.shutdown);
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };
        let poll = PollLoop {
            rpc: Arc::clone(&self.rpc),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            wake: Arc::clone(&self.wake),
            interval: self.config.poll_interval,
            shutdown,
        };
        *worker = Some(tokio::spawn(poll.run()));
    }
}

#[async_trait]
impl TaskEngine for Aria2Engine {
    fn backend(&self) -> Backend {
        Backend::Remote
    }

    async fn start(&self) -> EngineResult<()> {
        if let Some(launch) = &self.config.launch {
            let mut daemon = self.daemon.lock().await;
            if daemon.is_none() {
                *daemon = Some(Daemon::spawn(launch)?);
            }
        }
        let version = self.wait_ready().await?;
        info!(version = %version, "aria2 engine ready");
        self.spawn_sampler();
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        lock(&self.shutdown).cancel();
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "aria2 sampler task ended abnormally");
            }
        }
        lock(&self.state).clear();
        if let Some(daemon) = self.daemon.lock().await.take() {
            daemon.shutdown().await;
        }
        info!("aria2 engine stopped");
        Ok(())
    }

    async fn submit(&self, request: SubmitRequest) -> EngineResult<EngineHandle> {
        let options = Value::Object(download_options(&request.options));
        let gid: String = match &request.source {
            TaskSource::Magnet { uri } => {
                call_as(self.rpc.as_ref(), "aria2.addUri", vec![json!([uri]), options]).await?
            }
            TaskSource::Url { url } => {
                call_as(self.rpc.as_ref(), "aria2.addUri", vec![json!([url]), options]).await?
            }
            TaskSource::Metainfo { bytes } => {
                call_as(
                    self.rpc.as_ref(),
                    "aria2.addTorrent",
                    vec![Value::from(STANDARD.encode(bytes)), json!([]), options],
                )
                .await?
            }
        };
        let handle = EngineHandle::new(gid);
        lock(&self.state).track(handle.clone());
        self.wake.notify_one();
        info!(handle = %handle, kind = ?request.source.kind(), "submitted download to aria2");
        Ok(handle)
    }

    async fn pause(&self, handle: &EngineHandle) -> EngineResult<()> {
        self.gid_call("aria2.forcePause", handle).await?;
        debug!(handle = %handle, "paused aria2 download");
        Ok(())
    }

    async fn resume(&self, handle: &EngineHandle) -> EngineResult<()> {
        self.gid_call("aria2.unpause", handle).await?;
        self.wake.notify_one();
        debug!(handle = %handle, "resumed aria2 download");
        Ok(())
    }

    async fn cancel(&self, handle: &EngineHandle) -> EngineResult<()> {
        lock(&self.state).silence(handle);
        match self.gid_call("aria2.forceRemove", handle).await {
            Ok(_) => Ok(()),
            Err(err @ RpcError::Daemon { .. }) => {
                // already stopped: only the result entry remains
                if self
                    .gid_call("aria2.removeDownloadResult", handle)
                    .await
                    .is_ok()
                {
                    Ok(())
                } else {
                    Err(err.into())
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn remove(&self, handle: &EngineHandle, options: RemoveOptions) -> EngineResult<()> {
        let payload = if options.delete_files {
            self.status(handle).await.ok().and_then(|snapshot| snapshot.path)
        } else {
            None
        };
        self.cancel(handle).await?;
        if let Err(err) = self.gid_call("aria2.removeDownloadResult", handle).await {
            debug!(handle = %handle, detail = %err.detail(), "download result not purged yet");
        }
        if let Some(path) = payload {
            delete_payload(Path::new(&path)).await;
        }
        info!(handle = %handle, delete_files = options.delete_files, "removed aria2 download");
        Ok(())
    }

    async fn status(&self, handle: &EngineHandle) -> EngineResult<TaskSnapshot> {
        let gid = self.gid(handle);
        let status: DownloadStatus = call_as(
            self.rpc.as_ref(),
            "aria2.tellStatus",
            vec![Value::from(gid), Value::from(STATUS_KEYS.to_vec())],
        )
        .await
        .map_err(|err| match err {
            RpcError::Daemon { .. } => EngineError::UnknownHandle {
                handle: handle.to_string(),
            },
            other => other.into(),
        })?;
        Ok(status.snapshot(handle.clone()))
    }

    async fn list(&self) -> EngineResult<Vec<TaskSnapshot>> {
        let lists = DaemonLists::fetch(self.rpc.as_ref()).await?;
        let snapshots = {
            let mut state = lock(&self.state);
            state.adopt(&lists);
            lists
                .active
                .iter()
                .chain(&lists.waiting)
                .chain(lists.stopped.iter().filter(|s| s.followed_by.is_empty()))
                .map(|status| status.snapshot(state.handle_for(&status.gid)))
                .collect::<Vec<_>>()
        };
        self.wake.notify_one();
        Ok(snapshots)
    }

    async fn configure(&self, settings: &EngineSettings) -> EngineResult<()> {
        self.rpc
            .call(
                "aria2.changeGlobalOption",
                vec![Value::Object(global_options(settings))],
            )
            .await?;
        debug!(max_concurrent = settings.max_concurrent, "pushed global options to aria2");
        Ok(())
    }

    async fn version(&self) -> EngineResult<String> {
        let info: VersionInfo =
            call_as(self.rpc.as_ref(), "aria2.getVersion", Vec::new()).await?;
        Ok(format!("aria2 {}", info.version))
    }
}

async fn delete_payload(path: &Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        warn!(path = %path.display(), error = %err, "failed to delete downloaded files");
    }
    let mut control = path.as_os_str().to_owned();
    control.push(".aria2");
    if let Err(err) = tokio::fs::remove_file(&control).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!(error = %err, "failed to delete aria2 control file");
        }
    }
}
