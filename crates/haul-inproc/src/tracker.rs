//! Live task table shared by the engine, its watchers, and the sampler.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use haul_core::{
    Backend, CopyRequest, EngineEvent, EngineEventKind, EngineEvents, EngineHandle, FileProgress,
    ProgressSample, TaskSnapshot, TaskStatus, TransferProgress, eta_seconds,
};
use tokio_util::sync::CancellationToken;

use crate::session::{TorrentKey, TorrentMeta, TorrentStats};

/// What a tracked task is executing.
#[derive(Debug, Clone)]
pub(crate) enum Work {
    Torrent {
        key: TorrentKey,
        meta: Option<TorrentMeta>,
        selected: Vec<usize>,
    },
    Http {
        request: CopyRequest,
        progress: TransferProgress,
    },
}

/// One task owned by the in-process engine.
#[derive(Debug)]
pub(crate) struct Tracked {
    pub(crate) work: Work,
    pub(crate) cancel: CancellationToken,
    pub(crate) status: TaskStatus,
    pub(crate) directory: PathBuf,
    pub(crate) name: Option<String>,
    downloaded: u64,
    total: u64,
    speed: u64,
    last_bytes: u64,
    last_sample: Instant,
    files: Vec<FileProgress>,
}

impl Tracked {
    pub(crate) fn new(work: Work, directory: PathBuf, name: Option<String>, status: TaskStatus) -> Self {
        Self {
            work,
            cancel: CancellationToken::new(),
            status,
            directory,
            name,
            downloaded: 0,
            total: 0,
            speed: 0,
            last_bytes: 0,
            last_sample: Instant::now(),
            files: Vec::new(),
        }
    }

    /// Fold new byte counters into the throughput estimate.
    pub(crate) fn observe(&mut self, downloaded: u64, total: u64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_sample).as_secs_f64();
        let delta = downloaded.saturating_sub(self.last_bytes);
        self.speed = if elapsed > 0.0 && self.status == TaskStatus::Active {
            #[allow(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                clippy::cast_precision_loss
            )]
            let speed = (delta as f64 / elapsed) as u64;
            speed
        } else {
            0
        };
        self.downloaded = downloaded;
        if total > 0 {
            self.total = total;
        }
        self.last_bytes = downloaded;
        self.last_sample = now;
    }

    pub(crate) fn observe_files(&mut self, stats: &TorrentStats) {
        let Work::Torrent { meta: Some(meta), selected, .. } = &self.work else {
            return;
        };
        if meta.files.len() < 2 {
            return;
        }
        self.files = meta
            .files
            .iter()
            .enumerate()
            .filter(|(index, _)| selected.is_empty() || selected.contains(index))
            .map(|(index, file)| FileProgress {
                index,
                path: file.path.clone(),
                downloaded: stats.file_downloaded.get(index).copied().unwrap_or(0),
                total: file.length,
            })
            .collect();
    }

    /// Reset throughput bookkeeping after a transfer restarts from zero.
    pub(crate) fn restart_counters(&mut self) {
        self.last_bytes = 0;
        self.speed = 0;
        self.last_sample = Instant::now();
    }

    pub(crate) fn sample(&self) -> ProgressSample {
        ProgressSample {
            downloaded: self.downloaded,
            total: self.total,
            speed: self.speed,
            eta_seconds: eta_seconds(self.downloaded, self.total, self.speed),
            files: self.files.clone(),
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        matches!(self.work, Work::Torrent { meta: Some(_), .. })
            && self.total > 0
            && self.downloaded >= self.total
    }

    /// Final on-disk location of the payload.
    pub(crate) fn payload_path(&self) -> PathBuf {
        match &self.work {
            Work::Torrent { meta: Some(meta), .. } => self.directory.join(&meta.name),
            Work::Http { request, .. } => request.destination_dir.join(&request.filename),
            Work::Torrent { meta: None, .. } => self.directory.clone(),
        }
    }

    pub(crate) fn snapshot(&self, handle: &EngineHandle) -> TaskSnapshot {
        let mut snapshot = TaskSnapshot::new(handle.clone(), Backend::InProcess, self.status);
        snapshot.name.clone_from(&self.name);
        snapshot.downloaded = self.downloaded;
        snapshot.total = self.total;
        snapshot.speed = self.speed;
        snapshot.eta_seconds = eta_seconds(self.downloaded, self.total, self.speed);
        snapshot.files.clone_from(&self.files);
        if matches!(self.work, Work::Http { .. } | Work::Torrent { meta: Some(_), .. }) {
            snapshot.path = Some(self.payload_path().to_string_lossy().into_owned());
        }
        snapshot
    }
}

/// Table of live tasks plus the event sink terminal transitions go through.
#[derive(Debug)]
pub(crate) struct Tracker {
    tasks: Mutex<BTreeMap<EngineHandle, Tracked>>,
    events: EngineEvents,
}

impl Tracker {
    pub(crate) fn new(events: EngineEvents) -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BTreeMap<EngineHandle, Tracked>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn events(&self) -> &EngineEvents {
        &self.events
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove the task and emit its terminal event.
    ///
    /// Only the caller that actually removes the entry emits, so a task never
    /// reports twice.
    pub(crate) fn finish(&self, handle: &EngineHandle, kind: EngineEventKind) -> Option<Tracked> {
        let removed = self.lock().remove(handle)?;
        removed.cancel.cancel();
        self.events.emit(EngineEvent {
            handle: handle.clone(),
            kind,
        });
        Some(removed)
    }

    /// Remove the task without an event.
    pub(crate) fn take(&self, handle: &EngineHandle) -> Option<Tracked> {
        let removed = self.lock().remove(handle)?;
        removed.cancel.cancel();
        Some(removed)
    }

    /// Drop every task silently.
    pub(crate) fn drain(&self) -> Vec<(EngineHandle, Tracked)> {
        let drained = std::mem::take(&mut *self.lock());
        for task in drained.values() {
            task.cancel.cancel();
        }
        drained.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use haul_core::{TransferConfig, engine_events};

    use crate::session::TorrentFile;

    fn http_task() -> Tracked {
        Tracked::new(
            Work::Http {
                request: CopyRequest {
                    destination_dir: PathBuf::from("/dl"),
                    filename: "f.iso".into(),
                    source_url: "https://example.com/f.iso".into(),
                    transfer: TransferConfig::default(),
                },
                progress: TransferProgress::default(),
            },
            PathBuf::from("/dl"),
            Some("f.iso".into()),
            TaskStatus::Active,
        )
    }

    #[test]
    fn throughput_comes_from_byte_deltas() {
        let mut task = http_task();
        let start = task.last_sample;
        task.observe(4_000, 10_000, start + Duration::from_secs(2));
        assert_eq!(task.sample().speed, 2_000);
        assert_eq!(task.sample().eta_seconds, Some(3));
        task.observe(4_000, 0, start + Duration::from_secs(4));
        assert_eq!(task.sample().speed, 0);
        assert_eq!(task.sample().total, 10_000);
    }

    #[test]
    fn paused_tasks_report_zero_speed() {
        let mut task = http_task();
        task.status = TaskStatus::Paused;
        let start = task.last_sample;
        task.observe(1_000, 2_000, start + Duration::from_secs(1));
        assert_eq!(task.sample().speed, 0);
    }

    #[test]
    fn multi_file_torrents_report_selected_files() {
        let meta = TorrentMeta {
            name: "set".into(),
            files: vec![
                TorrentFile {
                    path: "set/a".into(),
                    length: 10,
                },
                TorrentFile {
                    path: "set/b".into(),
                    length: 20,
                },
            ],
        };
        let mut task = Tracked::new(
            Work::Torrent {
                key: TorrentKey("aa".into()),
                meta: Some(meta),
                selected: vec![1],
            },
            PathBuf::from("/dl"),
            None,
            TaskStatus::Active,
        );
        task.observe_files(&TorrentStats {
            downloaded: 5,
            total: 20,
            file_downloaded: vec![0, 5],
            new_pieces: Vec::new(),
        });
        let files = task.sample().files;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].index, 1);
        assert_eq!(files[0].downloaded, 5);
        assert_eq!(task.payload_path(), PathBuf::from("/dl/set"));
    }

    #[tokio::test]
    async fn finish_reports_once() {
        let (events, mut rx) = engine_events();
        let tracker = Tracker::new(events);
        let handle = EngineHandle::new("h");
        tracker.lock().insert(handle.clone(), http_task());
        assert!(
            tracker
                .finish(&handle, EngineEventKind::Failed { message: "x".into() })
                .is_some()
        );
        assert!(
            tracker
                .finish(&handle, EngineEventKind::Failed { message: "y".into() })
                .is_none()
        );
        let event = rx.recv().await.expect("event");
        assert_eq!(event.kind, EngineEventKind::Failed { message: "x".into() });
        assert!(rx.try_recv().is_err());
    }
}
