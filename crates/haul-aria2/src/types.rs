//! Daemon status payloads and their conversion into engine snapshots.

use std::path::{Component, Path, PathBuf};

use haul_core::{Backend, EngineHandle, FileProgress, TaskSnapshot, TaskStatus, eta_seconds};
use serde::{Deserialize, Deserializer};

/// Keys requested from every `tell*` call.
pub(crate) const STATUS_KEYS: [&str; 11] = [
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "dir",
    "files",
    "errorCode",
    "errorMessage",
    "followedBy",
    "bittorrent",
];

/// One entry returned by `aria2.tellStatus`, `tellActive`, `tellWaiting` or `tellStopped`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStatus {
    /// Daemon-assigned identifier.
    pub gid: String,
    /// `active`, `waiting`, `paused`, `error`, `complete` or `removed`.
    pub status: String,
    /// Declared size in bytes.
    #[serde(default, deserialize_with = "numeric")]
    pub total_length: u64,
    /// Bytes fetched.
    #[serde(default, deserialize_with = "numeric")]
    pub completed_length: u64,
    /// Bytes per second.
    #[serde(default, deserialize_with = "numeric")]
    pub download_speed: u64,
    /// Target directory.
    #[serde(default)]
    pub dir: String,
    /// Constituent files.
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Daemon error code, as text.
    pub error_code: Option<String>,
    /// Daemon error message.
    pub error_message: Option<String>,
    /// Downloads spawned by this one (magnet metadata fetches hand over to the payload).
    #[serde(default)]
    pub followed_by: Vec<String>,
    /// Torrent metadata, for BitTorrent downloads.
    pub bittorrent: Option<BitTorrentInfo>,
}

/// File entry inside a download.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// One-based file index.
    #[serde(default, deserialize_with = "numeric")]
    pub index: u64,
    /// Absolute path on the daemon host.
    #[serde(default)]
    pub path: String,
    /// Size in bytes.
    #[serde(default, deserialize_with = "numeric")]
    pub length: u64,
    /// Bytes fetched.
    #[serde(default, deserialize_with = "numeric")]
    pub completed_length: u64,
    /// `"true"` when the file is part of the selection.
    #[serde(default)]
    pub selected: String,
}

/// BitTorrent block of a status entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BitTorrentInfo {
    /// `info` dictionary subset.
    pub info: Option<BitTorrentName>,
}

/// Torrent display name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BitTorrentName {
    /// Torrent name.
    pub name: Option<String>,
}

/// `aria2.getVersion` result.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    /// Daemon version string.
    pub version: String,
}

fn numeric<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
    }
}

/// Map a daemon status label onto the lifecycle vocabulary.
#[must_use]
pub fn map_status(label: &str) -> TaskStatus {
    match label {
        "active" => TaskStatus::Active,
        "waiting" => TaskStatus::Waiting,
        "paused" => TaskStatus::Paused,
        "complete" => TaskStatus::Complete,
        _ => TaskStatus::Error,
    }
}

impl DownloadStatus {
    fn selected_files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files
            .iter()
            .filter(|file| file.selected != "false" && !file.path.is_empty())
    }

    /// Whether this entry only fetched torrent metadata for a magnet link.
    #[must_use]
    pub fn is_metadata_fetch(&self) -> bool {
        self.files
            .first()
            .is_some_and(|file| file.path.starts_with("[METADATA]"))
    }

    /// Human name for the download.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        if let Some(name) = self
            .bittorrent
            .as_ref()
            .and_then(|bt| bt.info.as_ref())
            .and_then(|info| info.name.clone())
        {
            return Some(name);
        }
        self.resolved_path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Final payload path: the first file for single-file downloads, or the
    /// top-level directory when the download produced a tree.
    #[must_use]
    pub fn resolved_path(&self) -> PathBuf {
        let dir = Path::new(&self.dir);
        let mut files = self.selected_files();
        let Some(first) = files.next() else {
            return dir.to_path_buf();
        };
        let multi = files.next().is_some();
        let path = Path::new(&first.path);
        let relative = path.strip_prefix(dir).unwrap_or(path);
        if !multi {
            return if relative.is_absolute() {
                relative.to_path_buf()
            } else {
                dir.join(relative)
            };
        }
        match relative.components().find(|c| matches!(c, Component::Normal(_))) {
            Some(Component::Normal(top)) => dir.join(top),
            _ => dir.to_path_buf(),
        }
    }

    /// Failure text for errored downloads.
    #[must_use]
    pub fn failure(&self) -> String {
        match (&self.error_code, &self.error_message) {
            (_, Some(message)) if !message.is_empty() => message.clone(),
            (Some(code), _) => format!("aria2 error code {code}"),
            _ if self.status == "removed" => "removed from daemon".to_string(),
            _ => "download failed".to_string(),
        }
    }

    /// Per-file progress; empty for single-file downloads.
    #[must_use]
    pub fn file_progress(&self) -> Vec<FileProgress> {
        let files: Vec<&FileEntry> = self.selected_files().collect();
        if files.len() < 2 {
            return Vec::new();
        }
        files
            .into_iter()
            .map(|file| FileProgress {
                index: usize::try_from(file.index.saturating_sub(1)).unwrap_or(usize::MAX),
                path: Path::new(&file.path)
                    .strip_prefix(&self.dir)
                    .map_or_else(|_| file.path.clone(), |rel| rel.to_string_lossy().into_owned()),
                downloaded: file.completed_length,
                total: file.length,
            })
            .collect()
    }

    /// Convert into an engine snapshot under `handle`.
    #[must_use]
    pub fn snapshot(&self, handle: EngineHandle) -> TaskSnapshot {
        let status = map_status(&self.status);
        let mut snapshot = TaskSnapshot::new(handle, Backend::Remote, status);
        snapshot.name = self.name();
        snapshot.downloaded = self.completed_length;
        snapshot.total = self.total_length;
        snapshot.speed = self.download_speed;
        snapshot.eta_seconds =
            eta_seconds(self.completed_length, self.total_length, self.download_speed);
        snapshot.files = self.file_progress();
        if !self.dir.is_empty() {
            snapshot.path = Some(self.resolved_path().to_string_lossy().into_owned());
        }
        if status == TaskStatus::Error {
            snapshot.error = Some(self.failure());
        }
        snapshot
    }
}
