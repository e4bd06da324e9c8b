//! BitTorrent client seam used by the in-process engine.

use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

#[cfg(feature = "rqbit")]
mod rqbit;
pub mod stub;

#[cfg(feature = "rqbit")]
pub use rqbit::RqbitSession;
pub use stub::StubSession;

/// Session-side identity of a torrent (lowercase hex info-hash where known).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TorrentKey(pub String);

impl Display for TorrentKey {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Torrent payload handed to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentPayload {
    /// Magnet URI; metadata arrives from peers.
    Magnet(String),
    /// Bencoded metainfo.
    Metainfo(Vec<u8>),
}

/// Request to add a torrent in a stopped state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentAdd {
    /// What to add.
    pub payload: TorrentPayload,
    /// Info-hash parsed from a magnet URI, when available.
    pub info_hash: Option<String>,
    /// Directory the payload lands in.
    pub output_dir: PathBuf,
}

/// One file inside a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path relative to the output directory.
    pub path: String,
    /// Declared length in bytes.
    pub length: u64,
}

/// Metadata resolved for a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMeta {
    /// Torrent name; the top-level file or directory on disk.
    pub name: String,
    /// Constituent files in metainfo order.
    pub files: Vec<TorrentFile>,
}

impl TorrentMeta {
    /// Sum of declared file lengths.
    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|file| file.length).sum()
    }
}

/// Live counters for one torrent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TorrentStats {
    /// Verified bytes of the selected files.
    pub downloaded: u64,
    /// Declared bytes of the selected files.
    pub total: u64,
    /// Verified bytes per file, in metainfo order.
    pub file_downloaded: Vec<u64>,
    /// Pieces verified since the previous sample.
    pub new_pieces: Vec<u32>,
}

/// Pieces that lie entirely inside fully downloaded files.
///
/// Sessions that only expose per-file progress report verified pieces at this
/// granularity: a piece counts once every file it overlaps is complete.
#[must_use]
pub fn pieces_in_finished_files(
    piece_length: u64,
    file_lengths: &[u64],
    file_progress: &[u64],
) -> Vec<u32> {
    if piece_length == 0 {
        return Vec::new();
    }
    let mut spans = Vec::with_capacity(file_lengths.len());
    let mut offset = 0_u64;
    for (index, &length) in file_lengths.iter().enumerate() {
        let done = file_progress.get(index).is_some_and(|&got| got >= length);
        spans.push((offset, offset + length, done));
        offset += length;
    }
    let total = offset;

    let mut pieces = Vec::new();
    let mut first = 0;
    for piece in 0..total.div_ceil(piece_length) {
        let start = piece * piece_length;
        let end = (start + piece_length).min(total);
        while first < spans.len() && spans[first].1 <= start {
            first += 1;
        }
        let complete = spans[first..]
            .iter()
            .take_while(|span| span.0 < end)
            .all(|span| span.2);
        if complete && let Ok(piece) = u32::try_from(piece) {
            pieces.push(piece);
        }
    }
    pieces
}

/// Embedded BitTorrent client.
///
/// Torrents are added stopped; the engine activates them once metadata has
/// arrived and the file selection is known.
#[async_trait]
pub trait TorrentSession: Send + Sync {
    /// Backend name reported in `version()`.
    fn name(&self) -> &'static str;

    /// Add a torrent without starting the download.
    async fn add(&self, request: &TorrentAdd) -> Result<TorrentKey>;

    /// Wait until metadata for `key` is known.
    async fn wait_metadata(&self, key: &TorrentKey) -> Result<TorrentMeta>;

    /// Start downloading, limited to `only_files` when non-empty.
    async fn activate(&self, key: &TorrentKey, only_files: &[usize]) -> Result<()>;

    /// Current counters; `None` once the torrent is gone.
    fn stats(&self, key: &TorrentKey) -> Option<TorrentStats>;

    /// Pause transfer.
    async fn pause(&self, key: &TorrentKey) -> Result<()>;

    /// Resume transfer.
    async fn resume(&self, key: &TorrentKey) -> Result<()>;

    /// Drop the torrent, optionally deleting its payload.
    async fn remove(&self, key: &TorrentKey, delete_files: bool) -> Result<()>;

    /// Apply a session-wide download cap (zero = unlimited).
    async fn set_download_limit(&self, bytes_per_second: u64) -> Result<()> {
        let _ = bytes_per_second;
        Ok(())
    }
}
