//! [`TorrentSession`] backed by `librqbit`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use librqbit::api::TorrentIdOrHash;
use librqbit::limits::LimitsConfig;
use librqbit::{AddTorrent, AddTorrentOptions, ManagedTorrent, Session, SessionOptions};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    TorrentAdd, TorrentFile, TorrentKey, TorrentMeta, TorrentPayload, TorrentSession, TorrentStats,
    pieces_in_finished_files,
};
use crate::storage::DynamicStorage;

/// Mirrors librqbit's `ManagedTorrentHandle`, which is not re-exported.
type ManagedTorrentHandle = Arc<ManagedTorrent>;

type Slot = Option<Result<ManagedTorrentHandle, String>>;

enum Entry {
    // magnet adds resolve metadata before librqbit hands out a handle
    Pending {
        slot: watch::Receiver<Slot>,
        task: JoinHandle<()>,
    },
    Ready(ManagedTorrentHandle),
}

struct PieceLayout {
    piece_length: u64,
    file_lengths: Vec<u64>,
    reported: BTreeSet<u32>,
}

/// Embedded BitTorrent client.
///
/// The download cap is fixed when the session starts.
pub struct RqbitSession {
    session: Arc<Session>,
    storage: Arc<DynamicStorage>,
    download_limit: u64,
    torrents: Mutex<HashMap<TorrentKey, Entry>>,
    layouts: Mutex<HashMap<TorrentKey, PieceLayout>>,
}

impl RqbitSession {
    /// Start a session writing into `default_dir` unless storage overrides it,
    /// capped at `download_limit` bytes per second (zero = unlimited).
    ///
    /// # Errors
    ///
    /// Fails when the client cannot bind its listeners or DHT.
    pub async fn new(
        default_dir: PathBuf,
        storage: Arc<DynamicStorage>,
        download_limit: u64,
    ) -> Result<Self> {
        let options = SessionOptions {
            ratelimits: LimitsConfig {
                upload_bps: None,
                download_bps: rate_cap(download_limit),
            },
            ..SessionOptions::default()
        };
        let session = Session::new_with_opts(default_dir, options)
            .await
            .context("starting librqbit session")?;
        Ok(Self {
            session,
            storage,
            download_limit,
            torrents: Mutex::new(HashMap::new()),
            layouts: Mutex::new(HashMap::new()),
        })
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TorrentKey, Entry>> {
        self.torrents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn layouts(&self) -> MutexGuard<'_, HashMap<TorrentKey, PieceLayout>> {
        self.layouts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle(&self, key: &TorrentKey) -> Result<ManagedTorrentHandle> {
        let mut slot = match self.entries().get(key) {
            Some(Entry::Ready(handle)) => return Ok(Arc::clone(handle)),
            Some(Entry::Pending { slot, .. }) => slot.clone(),
            None => bail!("unknown torrent {key}"),
        };
        let outcome = slot
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow!("torrent {key} removed while adding"))?
            .clone();
        match outcome {
            Some(Ok(handle)) => {
                self.entries()
                    .insert(key.clone(), Entry::Ready(Arc::clone(&handle)));
                Ok(handle)
            }
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("torrent {key} has no handle")),
        }
    }

    fn ready(&self, key: &TorrentKey) -> Option<ManagedTorrentHandle> {
        match self.entries().get(key) {
            Some(Entry::Ready(handle)) => Some(Arc::clone(handle)),
            _ => None,
        }
    }
}

fn rate_cap(bytes_per_second: u64) -> Option<NonZeroU32> {
    if bytes_per_second == 0 {
        return None;
    }
    NonZeroU32::new(u32::try_from(bytes_per_second).unwrap_or(u32::MAX))
}

fn add_options(output_dir: &std::path::Path) -> AddTorrentOptions {
    AddTorrentOptions {
        paused: true,
        overwrite: true,
        output_folder: Some(output_dir.to_string_lossy().into_owned()),
        ..AddTorrentOptions::default()
    }
}

#[async_trait]
impl TorrentSession for RqbitSession {
    fn name(&self) -> &'static str {
        "librqbit"
    }

    async fn add(&self, request: &TorrentAdd) -> Result<TorrentKey> {
        match &request.payload {
            TorrentPayload::Magnet(uri) => {
                let hash = request
                    .info_hash
                    .clone()
                    .context("magnet link carries no btih info-hash")?;
                let key = TorrentKey(hash);
                let output_dir = self.storage.dir_for(&key.0);
                let (sender, slot) = watch::channel(None);
                let session = Arc::clone(&self.session);
                let uri = uri.clone();
                let task = tokio::spawn(async move {
                    let outcome = session
                        .add_torrent(AddTorrent::from_url(uri), Some(add_options(&output_dir)))
                        .await
                        .map_err(|err| format!("{err:#}"))
                        .and_then(|response| {
                            response
                                .into_handle()
                                .ok_or_else(|| "librqbit returned no handle".to_string())
                        });
                    sender.send_replace(Some(outcome));
                });
                let mut entries = self.entries();
                if entries.contains_key(&key) {
                    task.abort();
                    bail!("torrent {key} is already managed");
                }
                entries.insert(key.clone(), Entry::Pending { slot, task });
                Ok(key)
            }
            TorrentPayload::Metainfo(bytes) => {
                let response = self
                    .session
                    .add_torrent(
                        AddTorrent::from_bytes(bytes.clone()),
                        Some(add_options(&request.output_dir)),
                    )
                    .await
                    .context("adding torrent metainfo")?;
                let handle = response
                    .into_handle()
                    .context("librqbit returned no handle")?;
                let key = TorrentKey(handle.info_hash().as_string());
                self.entries().insert(key.clone(), Entry::Ready(handle));
                Ok(key)
            }
        }
    }

    async fn wait_metadata(&self, key: &TorrentKey) -> Result<TorrentMeta> {
        let handle = self.handle(key).await?;
        handle
            .wait_until_initialized()
            .await
            .with_context(|| format!("initialising torrent {key}"))?;
        let (piece_length, files) = handle.with_metadata(|meta| {
            let files = meta
                .file_infos
                .iter()
                .map(|file| TorrentFile {
                    path: file.relative_filename.to_string_lossy().into_owned(),
                    length: file.len,
                })
                .collect::<Vec<_>>();
            (u64::from(meta.info.piece_length), files)
        })?;
        self.layouts().insert(
            key.clone(),
            PieceLayout {
                piece_length,
                file_lengths: files.iter().map(|file| file.length).collect(),
                reported: BTreeSet::new(),
            },
        );
        let name = handle.name().unwrap_or_else(|| key.0.clone());
        Ok(TorrentMeta { name, files })
    }

    async fn activate(&self, key: &TorrentKey, only_files: &[usize]) -> Result<()> {
        let handle = self.handle(key).await?;
        if !only_files.is_empty() {
            let selection: HashSet<usize> = only_files.iter().copied().collect();
            self.session
                .update_only_files(&handle, &selection)
                .await
                .context("applying file selection")?;
        }
        self.session.unpause(&handle).await.context("starting torrent")?;
        debug!(torrent = %key, files = only_files.len(), "activated torrent");
        Ok(())
    }

    fn stats(&self, key: &TorrentKey) -> Option<TorrentStats> {
        let handle = self.ready(key)?;
        let stats = handle.stats();
        let new_pieces = self.layouts().get_mut(key).map_or_else(Vec::new, |layout| {
            pieces_in_finished_files(
                layout.piece_length,
                &layout.file_lengths,
                &stats.file_progress,
            )
            .into_iter()
            .filter(|piece| layout.reported.insert(*piece))
            .collect()
        });
        Some(TorrentStats {
            downloaded: stats.progress_bytes,
            total: stats.total_bytes,
            file_downloaded: stats.file_progress,
            new_pieces,
        })
    }

    async fn pause(&self, key: &TorrentKey) -> Result<()> {
        let handle = self.handle(key).await?;
        self.session.pause(&handle).await.context("pausing torrent")
    }

    async fn resume(&self, key: &TorrentKey) -> Result<()> {
        let handle = self.handle(key).await?;
        self.session.unpause(&handle).await.context("resuming torrent")
    }

    async fn remove(&self, key: &TorrentKey, delete_files: bool) -> Result<()> {
        self.layouts().remove(key);
        let entry = self
            .entries()
            .remove(key)
            .ok_or_else(|| anyhow!("unknown torrent {key} for remove"))?;
        match entry {
            Entry::Pending { task, .. } => {
                task.abort();
                Ok(())
            }
            Entry::Ready(handle) => {
                if let Err(err) = self
                    .session
                    .delete(TorrentIdOrHash::Id(handle.id()), delete_files)
                    .await
                {
                    warn!(torrent = %key, error = %err, "librqbit failed to drop torrent");
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    async fn set_download_limit(&self, bytes_per_second: u64) -> Result<()> {
        if bytes_per_second != self.download_limit {
            bail!(
                "librqbit download cap is fixed at {} B/s until restart; refusing {bytes_per_second} B/s",
                self.download_limit
            );
        }
        Ok(())
    }
}
