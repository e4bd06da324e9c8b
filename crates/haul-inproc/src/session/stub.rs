//! Scriptable in-memory session used by tests and when no client is compiled in.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::watch;

use super::{TorrentAdd, TorrentKey, TorrentMeta, TorrentSession, TorrentStats};
use crate::storage::DynamicStorage;

/// Piece size used to derive piece completion from byte counters.
pub const STUB_PIECE_LENGTH: u64 = 16 * 1024;

struct StubTorrent {
    output_dir: PathBuf,
    metadata: watch::Sender<Option<TorrentMeta>>,
    only_files: Option<Vec<usize>>,
    file_downloaded: Vec<u64>,
    pieces_reported: u64,
    paused: bool,
}

impl StubTorrent {
    fn meta(&self) -> Option<TorrentMeta> {
        self.metadata.borrow().clone()
    }

    fn selected(&self, index: usize) -> bool {
        self.only_files
            .as_ref()
            .is_some_and(|only| only.is_empty() || only.contains(&index))
    }
}

/// In-memory [`TorrentSession`] whose progress is driven by the caller.
pub struct StubSession {
    storage: Arc<DynamicStorage>,
    torrents: Mutex<HashMap<TorrentKey, StubTorrent>>,
    auto_metadata: Mutex<Option<TorrentMeta>>,
    add_failure: Mutex<Option<String>>,
    removed: Mutex<Vec<(TorrentKey, bool)>>,
    download_limit: AtomicU64,
    next_key: AtomicU64,
}

impl StubSession {
    /// Session that resolves payload directories through `storage`.
    #[must_use]
    pub fn new(storage: Arc<DynamicStorage>) -> Self {
        Self {
            storage,
            torrents: Mutex::new(HashMap::new()),
            auto_metadata: Mutex::new(None),
            add_failure: Mutex::new(None),
            removed: Mutex::new(Vec::new()),
            download_limit: AtomicU64::new(0),
            next_key: AtomicU64::new(1),
        }
    }

    /// Publish `meta` immediately for every torrent added from now on.
    pub fn set_auto_metadata(&self, meta: Option<TorrentMeta>) {
        *guard(&self.auto_metadata) = meta;
    }

    /// Make subsequent adds fail with `message`.
    pub fn fail_adds(&self, message: impl Into<String>) {
        *guard(&self.add_failure) = Some(message.into());
    }

    /// Deliver metadata for a torrent that is waiting on peers.
    ///
    /// # Errors
    ///
    /// Fails when the torrent is unknown.
    pub fn publish_metadata(&self, key: &TorrentKey, meta: TorrentMeta) -> Result<()> {
        let mut torrents = guard(&self.torrents);
        let torrent = torrents
            .get_mut(key)
            .ok_or_else(|| anyhow!("unknown torrent {key}"))?;
        torrent.file_downloaded = vec![0; meta.files.len()];
        torrent.metadata.send_replace(Some(meta));
        Ok(())
    }

    /// Verify `bytes` more of the selected files, in file order.
    ///
    /// Paused or inactive torrents do not move.
    pub fn advance(&self, key: &TorrentKey, bytes: u64) {
        let mut torrents = guard(&self.torrents);
        let Some(torrent) = torrents.get_mut(key) else {
            return;
        };
        if torrent.paused || torrent.only_files.is_none() {
            return;
        }
        let Some(meta) = torrent.meta() else {
            return;
        };
        let mut remaining = bytes;
        for (index, file) in meta.files.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if !torrent.selected(index) {
                continue;
            }
            let Some(done) = torrent.file_downloaded.get_mut(index) else {
                continue;
            };
            let step = remaining.min(file.length.saturating_sub(*done));
            *done += step;
            remaining -= step;
        }
    }

    /// Directory the torrent was added into.
    #[must_use]
    pub fn output_dir(&self, key: &TorrentKey) -> Option<PathBuf> {
        guard(&self.torrents)
            .get(key)
            .map(|torrent| torrent.output_dir.clone())
    }

    /// Whether the session still holds `key`.
    #[must_use]
    pub fn contains(&self, key: &TorrentKey) -> bool {
        guard(&self.torrents).contains_key(key)
    }

    /// Whether `key` is paused.
    #[must_use]
    pub fn is_paused(&self, key: &TorrentKey) -> bool {
        guard(&self.torrents)
            .get(key)
            .is_some_and(|torrent| torrent.paused)
    }

    /// File selection applied at activation; `None` until activated.
    #[must_use]
    pub fn activated_files(&self, key: &TorrentKey) -> Option<Vec<usize>> {
        guard(&self.torrents)
            .get(key)
            .and_then(|torrent| torrent.only_files.clone())
    }

    /// Every removal seen so far with its `delete_files` flag.
    #[must_use]
    pub fn removed(&self) -> Vec<(TorrentKey, bool)> {
        guard(&self.removed).clone()
    }

    /// Last session-wide download cap applied.
    #[must_use]
    pub fn download_limit(&self) -> u64 {
        self.download_limit.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TorrentSession for StubSession {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn add(&self, request: &TorrentAdd) -> Result<TorrentKey> {
        if let Some(message) = guard(&self.add_failure).clone() {
            bail!(message);
        }
        let key = TorrentKey(request.info_hash.clone().unwrap_or_else(|| {
            format!("{:040x}", self.next_key.fetch_add(1, Ordering::Relaxed))
        }));
        let auto = guard(&self.auto_metadata).clone();
        let file_downloaded = auto
            .as_ref()
            .map_or_else(Vec::new, |meta| vec![0; meta.files.len()]);
        let (metadata, _) = watch::channel(auto);
        let mut torrents = guard(&self.torrents);
        if torrents.contains_key(&key) {
            bail!("torrent {key} is already managed");
        }
        let output_dir = if self.storage.is_registered(&key.0) {
            self.storage.dir_for(&key.0)
        } else {
            request.output_dir.clone()
        };
        torrents.insert(
            key.clone(),
            StubTorrent {
                output_dir,
                metadata,
                only_files: None,
                file_downloaded,
                pieces_reported: 0,
                paused: false,
            },
        );
        Ok(key)
    }

    async fn wait_metadata(&self, key: &TorrentKey) -> Result<TorrentMeta> {
        let mut receiver = guard(&self.torrents)
            .get(key)
            .map(|torrent| torrent.metadata.subscribe())
            .ok_or_else(|| anyhow!("unknown torrent {key}"))?;
        let meta = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow!("torrent {key} removed while waiting for metadata"))?
            .clone();
        meta.ok_or_else(|| anyhow!("metadata for {key} missing"))
    }

    async fn activate(&self, key: &TorrentKey, only_files: &[usize]) -> Result<()> {
        let mut torrents = guard(&self.torrents);
        let torrent = torrents
            .get_mut(key)
            .ok_or_else(|| anyhow!("unknown torrent {key}"))?;
        torrent.only_files = Some(only_files.to_vec());
        torrent.paused = false;
        Ok(())
    }

    fn stats(&self, key: &TorrentKey) -> Option<TorrentStats> {
        let mut torrents = guard(&self.torrents);
        let torrent = torrents.get_mut(key)?;
        let Some(meta) = torrent.meta() else {
            return Some(TorrentStats::default());
        };
        let mut stats = TorrentStats {
            file_downloaded: torrent.file_downloaded.clone(),
            ..TorrentStats::default()
        };
        for (index, file) in meta.files.iter().enumerate() {
            if torrent.selected(index) {
                stats.total += file.length;
                stats.downloaded += torrent.file_downloaded.get(index).copied().unwrap_or(0);
            }
        }
        let verified = stats.downloaded / STUB_PIECE_LENGTH;
        stats.new_pieces = (torrent.pieces_reported..verified)
            .filter_map(|piece| u32::try_from(piece).ok())
            .collect();
        torrent.pieces_reported = verified;
        Some(stats)
    }

    async fn pause(&self, key: &TorrentKey) -> Result<()> {
        let mut torrents = guard(&self.torrents);
        let torrent = torrents
            .get_mut(key)
            .ok_or_else(|| anyhow!("unknown torrent {key} for pause"))?;
        torrent.paused = true;
        Ok(())
    }

    async fn resume(&self, key: &TorrentKey) -> Result<()> {
        let mut torrents = guard(&self.torrents);
        let torrent = torrents
            .get_mut(key)
            .ok_or_else(|| anyhow!("unknown torrent {key} for resume"))?;
        torrent.paused = false;
        Ok(())
    }

    async fn remove(&self, key: &TorrentKey, delete_files: bool) -> Result<()> {
        if guard(&self.torrents).remove(key).is_none() {
            bail!("unknown torrent {key} for remove");
        }
        guard(&self.removed).push((key.clone(), delete_files));
        Ok(())
    }

    async fn set_download_limit(&self, bytes_per_second: u64) -> Result<()> {
        self.download_limit.store(bytes_per_second, Ordering::Relaxed);
        Ok(())
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
