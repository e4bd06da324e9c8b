//! Poll-driven synthesis of engine events from daemon task lists.
//!
//! The daemon exposes no push channel this engine consumes, so every tick the
//! three `tell*` lists are fetched and fed to [`SamplerState::observe`], which
//! turns list membership into progress and terminal events.
//!
//! # Invariants
//! - A handle produces at most one terminal event; once reported it never emits
//!   progress again.
//! - Handles the engine cancels or removes are silenced before the daemon call,
//!   so their `removed` state is never reported.
//! - A tracked handle missing from every list on two consecutive polls produces a
//!   single synthetic failure.
//! - Reported handles are remembered until they have been absent from every
//!   list for `REPORTED_RETENTION` consecutive polls, so a stopped entry that
//!   drops out of the window and returns stays quiet.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use haul_core::{EngineEvent, EngineEventKind, EngineEvents, EngineHandle, ProgressSample};
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::RpcResult;
use crate::rpc::{Aria2Rpc, Backoff, call_as};
use crate::types::{DownloadStatus, STATUS_KEYS};

/// Message carried by the synthetic failure for vanished handles.
pub const VANISHED_MESSAGE: &str = "task vanished from daemon";

const LIST_WINDOW: u64 = 1_000;
const MISSING_STRIKES: u8 = 2;
const REPORTED_RETENTION: u8 = 10;

/// The three daemon lists fetched on every tick.
#[derive(Debug, Clone, Default)]
pub struct DaemonLists {
    /// `aria2.tellActive`.
    pub active: Vec<DownloadStatus>,
    /// `aria2.tellWaiting` (queued and paused).
    pub waiting: Vec<DownloadStatus>,
    /// `aria2.tellStopped` (complete, error, removed).
    pub stopped: Vec<DownloadStatus>,
}

impl DaemonLists {
    /// Fetch all three lists, active first so a task moving to `stopped`
    /// mid-fetch is still observed.
    ///
    /// # Errors
    ///
    /// Returns the first failing call.
    pub async fn fetch(rpc: &dyn Aria2Rpc) -> RpcResult<Self> {
        let keys = Value::from(STATUS_KEYS.to_vec());
        let active = call_as(rpc, "aria2.tellActive", vec![keys.clone()]).await?;
        let waiting = call_as(
            rpc,
            "aria2.tellWaiting",
            vec![Value::from(0), Value::from(LIST_WINDOW), keys.clone()],
        )
        .await?;
        let stopped = call_as(
            rpc,
            "aria2.tellStopped",
            vec![Value::from(0), Value::from(LIST_WINDOW), keys],
        )
        .await?;
        Ok(Self {
            active,
            waiting,
            stopped,
        })
    }
}

/// Dedup and tracking state shared by the poll loop and the engine's calls.
#[derive(Debug, Default)]
pub struct SamplerState {
    tracked: HashSet<EngineHandle>,
    reported: HashSet<EngineHandle>,
    missing: HashMap<EngineHandle, u8>,
    unseen: HashMap<EngineHandle, u8>,
    aliases: HashMap<String, EngineHandle>,
    current: HashMap<EngineHandle, String>,
}

impl SamplerState {
    /// Start tracking a freshly submitted handle.
    pub fn track(&mut self, handle: EngineHandle) {
        self.reported.remove(&handle);
        self.unseen.remove(&handle);
        self.tracked.insert(handle);
    }

    /// Stop tracking `handle` and suppress any terminal event for it.
    pub fn silence(&mut self, handle: &EngineHandle) {
        self.tracked.remove(handle);
        self.missing.remove(handle);
        self.unseen.remove(handle);
        self.reported.insert(handle.clone());
    }

    /// Whether the poll loop has nothing to watch.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Whether `handle` already produced (or was denied) its terminal event.
    #[must_use]
    pub fn is_reported(&self, handle: &EngineHandle) -> bool {
        self.reported.contains(handle)
    }

    /// Daemon gid currently backing `handle`.
    #[must_use]
    pub fn gid_for(&self, handle: &EngineHandle) -> String {
        self.current
            .get(handle)
            .cloned()
            .unwrap_or_else(|| handle.as_str().to_string())
    }

    /// Handle a daemon gid is reported under.
    #[must_use]
    pub fn handle_for(&self, gid: &str) -> EngineHandle {
        self.aliases
            .get(gid)
            .cloned()
            .unwrap_or_else(|| EngineHandle::new(gid))
    }

    /// Drop every trace of the tracked handles.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Record follow-up downloads (magnet metadata → payload) so the payload keeps
    /// reporting under the original handle.
    pub fn link_followers(&mut self, stopped: &[DownloadStatus]) {
        for status in stopped {
            let Some(next) = status.followed_by.first() else {
                continue;
            };
            if self.aliases.contains_key(next) {
                continue;
            }
            let handle = self.handle_for(&status.gid);
            debug!(handle = %handle, gid = %next, "download handed over to follow-up gid");
            self.aliases.insert(next.clone(), handle.clone());
            self.current.insert(handle, next.clone());
        }
    }

    /// Adopt every handle visible in the active and waiting lists.
    pub fn adopt(&mut self, lists: &DaemonLists) {
        self.link_followers(&lists.stopped);
        for status in lists.active.iter().chain(&lists.waiting) {
            let handle = self.handle_for(&status.gid);
            if !self.reported.contains(&handle) {
                self.tracked.insert(handle);
            }
        }
    }

    /// Turn one poll into engine events.
    pub fn observe(&mut self, lists: &DaemonLists) -> Vec<EngineEvent> {
        self.link_followers(&lists.stopped);
        let mut seen = HashSet::new();
        let mut events = Vec::new();

        for status in &lists.active {
            let handle = self.handle_for(&status.gid);
            seen.insert(handle.clone());
            if self.reported.contains(&handle) {
                continue;
            }
            self.tracked.insert(handle.clone());
            events.push(EngineEvent {
                kind: EngineEventKind::Progress(sample(status)),
                handle,
            });
        }

        for status in &lists.waiting {
            let handle = self.handle_for(&status.gid);
            seen.insert(handle.clone());
            if !self.reported.contains(&handle) {
                self.tracked.insert(handle);
            }
        }

        for status in &lists.stopped {
            let handle = self.handle_for(&status.gid);
            seen.insert(handle.clone());
            if self.reported.contains(&handle) || !status.followed_by.is_empty() {
                continue;
            }
            if self.current.get(&handle).is_some_and(|gid| gid != &status.gid) {
                // superseded metadata entry
                continue;
            }
            let kind = if status.status == "complete" {
                EngineEventKind::Completed {
                    path: status.resolved_path(),
                }
            } else {
                EngineEventKind::Failed {
                    message: status.failure(),
                }
            };
            self.finish(&handle);
            events.push(EngineEvent { handle, kind });
        }

        let absent: Vec<EngineHandle> = self
            .tracked
            .iter()
            .filter(|handle| !seen.contains(*handle))
            .cloned()
            .collect();
        for handle in absent {
            let strikes = self.missing.entry(handle.clone()).or_insert(0);
            *strikes += 1;
            if *strikes >= MISSING_STRIKES {
                warn!(handle = %handle, "tracked download disappeared from every daemon list");
                self.finish(&handle);
                events.push(EngineEvent {
                    handle,
                    kind: EngineEventKind::Failed {
                        message: VANISHED_MESSAGE.to_string(),
                    },
                });
            }
        }
        for handle in &seen {
            self.missing.remove(handle);
        }
        self.prune(&seen);
        trace!(events = events.len(), tracked = self.tracked.len(), "sampled daemon lists");
        events
    }

    fn finish(&mut self, handle: &EngineHandle) {
        self.tracked.remove(handle);
        self.missing.remove(handle);
        self.unseen.remove(handle);
        self.reported.insert(handle.clone());
    }

    fn prune(&mut self, seen: &HashSet<EngineHandle>) {
        let mut purged = Vec::new();
        for handle in &self.reported {
            if seen.contains(handle) {
                self.unseen.remove(handle);
                continue;
            }
            let polls = self.unseen.entry(handle.clone()).or_insert(0);
            *polls += 1;
            if *polls >= REPORTED_RETENTION {
                purged.push(handle.clone());
            }
        }
        for handle in purged {
            self.reported.remove(&handle);
            self.unseen.remove(&handle);
            if let Some(gid) = self.current.remove(&handle) {
                self.aliases.remove(&gid);
            }
        }
    }
}

fn sample(status: &DownloadStatus) -> ProgressSample {
    ProgressSample {
        downloaded: status.completed_length,
        total: status.total_length,
        speed: status.download_speed,
        eta_seconds: haul_core::eta_seconds(
            status.completed_length,
            status.total_length,
            status.download_speed,
        ),
        files: status.file_progress(),
    }
}

/// Everything the background poll loop needs.
pub(crate) struct PollLoop {
    pub(crate) rpc: Arc<dyn Aria2Rpc>,
    pub(crate) events: EngineEvents,
    pub(crate) state: Arc<std::sync::Mutex<SamplerState>>,
    pub(crate) wake: Arc<Notify>,
    pub(crate) interval: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl PollLoop {
    /// Run until `shutdown` fires. Parks on `wake` while nothing is tracked.
    pub(crate) async fn run(self) {
        let mut backoff = Backoff::default();
        let mut first = true;
        loop {
            let idle = crate::lock(&self.state).is_idle();
            if idle && !first {
                trace!("aria2 sampler parked");
                tokio::select! {
                    () = self.wake.notified() => {}
                    () = self.shutdown.cancelled() => break,
                }
            }
            first = false;

            match DaemonLists::fetch(self.rpc.as_ref()).await {
                Ok(lists) => {
                    backoff.reset();
                    let events = crate::lock(&self.state).observe(&lists);
                    for event in events {
                        self.events.emit(event);
                    }
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(error = %err, detail = %err.detail(), retry_in = ?delay, "aria2 poll failed");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.shutdown.cancelled() => break,
                    }
                    if let Err(err) = self.rpc.reconnect().await {
                        debug!(detail = %err.detail(), "aria2 reconnect attempt failed");
                    }
                    continue;
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                () = self.shutdown.cancelled() => break,
            }
        }
        debug!("aria2 sampler stopped");
    }
}
