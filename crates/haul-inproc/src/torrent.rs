//! Metadata watcher for BitTorrent tasks.

use std::sync::Arc;
use std::time::Duration;

use haul_core::{EngineEventKind, EngineHandle, TaskStatus};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::{TorrentKey, TorrentMeta, TorrentSession};
use crate::storage::DynamicStorage;
use crate::tracker::{Tracker, Work};

/// Everything a watcher needs once it outlives the `submit` call.
#[derive(Clone)]
pub(crate) struct TorrentContext {
    pub(crate) session: Arc<dyn TorrentSession>,
    pub(crate) storage: Arc<DynamicStorage>,
    pub(crate) tracker: Arc<Tracker>,
    pub(crate) wake: Arc<Notify>,
}

impl TorrentContext {
    /// Wait for metadata, then activate the selected files.
    ///
    /// Timing out or failing reports an error and drops the torrent from the
    /// session; cancelling the task's token ends the wait silently.
    pub(crate) fn spawn_watcher(
        &self,
        handle: EngineHandle,
        key: TorrentKey,
        selected: Vec<usize>,
        timeout: Duration,
        cancel: CancellationToken,
    ) {
        let context = self.clone();
        tokio::spawn(async move {
            let waited = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(handle = %handle, "metadata wait cancelled");
                    return;
                }
                waited = tokio::time::timeout(timeout, context.session.wait_metadata(&key)) => waited,
            };
            match waited {
                Ok(Ok(meta)) => context.activate(&handle, &key, &selected, meta).await,
                Ok(Err(err)) => {
                    context
                        .fail(&handle, &key, format!("metadata unavailable: {err:#}"))
                        .await;
                }
                Err(_) => {
                    context
                        .fail(
                            &handle,
                            &key,
                            format!("metadata not received within {}s", timeout.as_secs()),
                        )
                        .await;
                }
            }
        });
    }

    async fn activate(
        &self,
        handle: &EngineHandle,
        key: &TorrentKey,
        selected: &[usize],
        meta: TorrentMeta,
    ) {
        let valid: Vec<usize> = selected
            .iter()
            .copied()
            .filter(|index| *index < meta.files.len())
            .collect();
        if !selected.is_empty() && valid.is_empty() {
            self.fail(handle, key, "no selected file exists in the torrent".to_string())
                .await;
            return;
        }
        if let Err(err) = self.session.activate(key, &valid).await {
            self.fail(handle, key, format!("failed to start torrent: {err:#}"))
                .await;
            return;
        }
        let name = meta.name.clone();
        let files = meta.files.len();
        let paused = {
            let mut tasks = self.tracker.lock();
            let Some(task) = tasks.get_mut(handle) else {
                // cancelled while activating
                return;
            };
            if task.name.is_none() {
                task.name = Some(name);
            }
            let paused = task.status == TaskStatus::Paused;
            if !paused {
                task.status = TaskStatus::Active;
            }
            task.work = Work::Torrent {
                key: key.clone(),
                meta: Some(meta),
                selected: valid,
            };
            paused
        };
        if paused {
            // paused while metadata was pending
            if let Err(err) = self.session.pause(key).await {
                warn!(handle = %handle, error = %format!("{err:#}"), "failed to keep torrent paused");
            }
        }
        self.wake.notify_one();
        info!(handle = %handle, files, "torrent metadata received");
    }

    /// Report a failure and drop the torrent from the session.
    pub(crate) async fn fail(&self, handle: &EngineHandle, key: &TorrentKey, message: String) {
        warn!(handle = %handle, error = %message, "torrent failed");
        if self
            .tracker
            .finish(handle, EngineEventKind::Failed { message })
            .is_none()
        {
            return;
        }
        self.drop_torrent(key, false).await;
    }

    /// Remove a torrent from the session and release its storage override.
    pub(crate) async fn drop_torrent(&self, key: &TorrentKey, delete_files: bool) {
        self.storage.unregister(&key.0);
        if let Err(err) = self.session.remove(key, delete_files).await {
            warn!(torrent = %key, error = %format!("{err:#}"), "session failed to remove torrent");
        }
    }
}
