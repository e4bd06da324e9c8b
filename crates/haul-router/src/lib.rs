#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! Hybrid engine: one [`TaskEngine`] facade over the remote and in-process
//! backends.
//!
//! # Design
//! - The backend is chosen once per task from the source kind and the
//!   configured preference, then remembered in a sticky map keyed by handle.
//! - Single-task calls only ever reach the owning backend.
//! - Handles this router did not submit (tasks that outlived a restart) are
//!   adopted from `list` snapshots, or found by asking each backend for
//!   their status on first use.
//! - `start`, `stop` and `configure` fan out to both backends.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use haul_core::{
    Backend, EngineError, EngineHandle, EngineResult, EngineSettings, RemoveOptions,
    SubmitRequest, TaskEngine, TaskSnapshot,
};
use tracing::{debug, info, warn};

/// Routes tasks to one of two concrete engines.
pub struct HybridRouter {
    remote: Arc<dyn TaskEngine>,
    in_process: Arc<dyn TaskEngine>,
    preferences: RwLock<(Backend, Backend)>,
    routes: RwLock<HashMap<EngineHandle, Backend>>,
}

impl HybridRouter {
    /// Router over the two backends using the preferences in `settings`.
    #[must_use]
    pub fn new(
        remote: Arc<dyn TaskEngine>,
        in_process: Arc<dyn TaskEngine>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            remote,
            in_process,
            preferences: RwLock::new((settings.torrent_backend, settings.http_backend)),
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Backend that owns `handle`, if routed.
    #[must_use]
    pub fn owner_of(&self, handle: &EngineHandle) -> Option<Backend> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(handle)
            .copied()
    }

    /// Number of live routing entries.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn engine(&self, backend: Backend) -> &Arc<dyn TaskEngine> {
        match backend {
            Backend::Remote => &self.remote,
            Backend::InProcess => &self.in_process,
        }
    }

    fn adopt(&self, handle: &EngineHandle, backend: Backend) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if !routes.contains_key(handle) {
            routes.insert(handle.clone(), backend);
            debug!(handle = %handle, engine = backend.as_str(), "adopted routing entry");
        }
    }

    async fn route(&self, handle: &EngineHandle) -> EngineResult<&Arc<dyn TaskEngine>> {
        if let Some(backend) = self.owner_of(handle) {
            return Ok(self.engine(backend));
        }
        for backend in [Backend::Remote, Backend::InProcess] {
            if self.engine(backend).status(handle).await.is_ok() {
                self.adopt(handle, backend);
                return Ok(self.engine(backend));
            }
        }
        Err(EngineError::UnknownHandle {
            handle: handle.to_string(),
        })
    }

    fn preferred(&self, request: &SubmitRequest) -> Backend {
        let (torrent, http) = *self
            .preferences
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        EngineSettings {
            torrent_backend: torrent,
            http_backend: http,
            ..EngineSettings::default()
        }
        .backend_for(request.source.kind())
    }
}

/// Run `first` and `second`, reporting the first failure after both ran.
fn both(first: EngineResult<()>, second: EngineResult<()>) -> EngineResult<()> {
    match (first, second) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
        (Err(err), Err(extra)) => {
            warn!(detail = %extra.detail(), "second backend also failed");
            Err(err)
        }
    }
}

#[async_trait]
impl TaskEngine for HybridRouter {
    /// The router has no identity of its own. This reports the remote
    /// backend as the fallback for unrouted handles; use
    /// [`TaskEngine::backend_of`] for a routed task's owner.
    fn backend(&self) -> Backend {
        Backend::Remote
    }

    fn backend_of(&self, handle: &EngineHandle) -> Backend {
        self.owner_of(handle).unwrap_or_else(|| self.backend())
    }

    async fn start(&self) -> EngineResult<()> {
        let remote = self.remote.start().await;
        let in_process = self.in_process.start().await;
        both(remote, in_process)
    }

    async fn stop(&self) -> EngineResult<()> {
        let remote = self.remote.stop().await;
        let in_process = self.in_process.stop().await;
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        both(remote, in_process)
    }

    async fn submit(&self, request: SubmitRequest) -> EngineResult<EngineHandle> {
        let backend = self.preferred(&request);
        let kind = request.source.kind();
        let handle = self.engine(backend).submit(request).await?;
        let previous = self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.clone(), backend);
        if let Some(previous) = previous.filter(|owner| *owner != backend) {
            warn!(handle = %handle, previous = previous.as_str(), "handle collided across backends");
        }
        info!(handle = %handle, engine = backend.as_str(), kind = ?kind, "routed task");
        Ok(handle)
    }

    async fn pause(&self, handle: &EngineHandle) -> EngineResult<()> {
        self.route(handle).await?.pause(handle).await
    }

    async fn resume(&self, handle: &EngineHandle) -> EngineResult<()> {
        self.route(handle).await?.resume(handle).await
    }

    async fn cancel(&self, handle: &EngineHandle) -> EngineResult<()> {
        self.route(handle).await?.cancel(handle).await
    }

    async fn remove(&self, handle: &EngineHandle, options: RemoveOptions) -> EngineResult<()> {
        let result = self.route(handle).await?.remove(handle, options).await;
        // the owner no longer knows the handle either way
        if matches!(result, Ok(()) | Err(EngineError::UnknownHandle { .. })) {
            self.routes
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(handle);
            debug!(handle = %handle, "dropped routing entry");
        }
        result
    }

    async fn status(&self, handle: &EngineHandle) -> EngineResult<TaskSnapshot> {
        self.route(handle).await?.status(handle).await
    }

    async fn list(&self) -> EngineResult<Vec<TaskSnapshot>> {
        let mut snapshots = self.remote.list().await?;
        snapshots.extend(self.in_process.list().await?);
        for snapshot in &snapshots {
            self.adopt(&snapshot.handle, snapshot.backend);
        }
        Ok(snapshots)
    }

    async fn configure(&self, settings: &EngineSettings) -> EngineResult<()> {
        *self
            .preferences
            .write()
            .unwrap_or_else(PoisonError::into_inner) =
            (settings.torrent_backend, settings.http_backend);
        let remote = self.remote.configure(settings).await;
        let in_process = self.in_process.configure(settings).await;
        both(remote, in_process)
    }

    async fn version(&self) -> EngineResult<String> {
        let remote = self.remote.version().await?;
        let in_process = self.in_process.version().await?;
        Ok(format!("remote: {remote}; in_process: {in_process}"))
    }
}
