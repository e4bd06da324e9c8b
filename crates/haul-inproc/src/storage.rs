//! Shared storage layer for concurrently running torrents.
//!
//! Every torrent may land in its own directory; the override is keyed by
//! info-hash so the session can ask where a payload belongs. Piece completion
//! is tracked per info-hash in one index file under the state directory, kept
//! apart from the content directories.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const INDEX_FILE: &str = "piece-index.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct PieceIndex {
    #[serde(default)]
    torrents: BTreeMap<String, BTreeSet<u32>>,
}

#[derive(Debug, Default)]
struct Registry {
    overrides: HashMap<String, PathBuf>,
    pieces: BTreeMap<String, BTreeSet<u32>>,
}

/// Per-info-hash directory overrides plus a persisted piece-completion index.
#[derive(Debug)]
pub struct DynamicStorage {
    state_dir: PathBuf,
    default_dir: RwLock<PathBuf>,
    registry: RwLock<Registry>,
    dirty: AtomicBool,
}

impl DynamicStorage {
    /// Storage rooted at `state_dir`, defaulting payloads to `default_dir`.
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>, default_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            default_dir: RwLock::new(default_dir.into()),
            registry: RwLock::new(Registry::default()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Location of the piece index.
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.state_dir.join(INDEX_FILE)
    }

    /// Change the directory used when no override is registered.
    pub fn set_default_dir(&self, dir: impl Into<PathBuf>) {
        *self
            .default_dir
            .write()
            .unwrap_or_else(PoisonError::into_inner) = dir.into();
    }

    /// Route `info_hash` into `dir`.
    pub fn register(&self, info_hash: &str, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        debug!(info_hash, dir = %dir.display(), "registered storage override");
        self.write().overrides.insert(normalise(info_hash), dir);
    }

    /// Drop the override and piece bookkeeping for `info_hash`.
    pub fn unregister(&self, info_hash: &str) {
        let key = normalise(info_hash);
        let mut registry = self.write();
        registry.overrides.remove(&key);
        if registry.pieces.remove(&key).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Directory payloads for `info_hash` are written to.
    #[must_use]
    pub fn dir_for(&self, info_hash: &str) -> PathBuf {
        if let Some(dir) = self.read().overrides.get(&normalise(info_hash)) {
            return dir.clone();
        }
        self.default_dir
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether an override exists for `info_hash`.
    #[must_use]
    pub fn is_registered(&self, info_hash: &str) -> bool {
        self.read().overrides.contains_key(&normalise(info_hash))
    }

    /// Record verified pieces.
    pub fn mark_pieces(&self, info_hash: &str, pieces: &[u32]) {
        if pieces.is_empty() {
            return;
        }
        let mut registry = self.write();
        let entry = registry.pieces.entry(normalise(info_hash)).or_default();
        let before = entry.len();
        entry.extend(pieces.iter().copied());
        if entry.len() != before {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Count of verified pieces for `info_hash`.
    #[must_use]
    pub fn completed_pieces(&self, info_hash: &str) -> usize {
        self.read()
            .pieces
            .get(&normalise(info_hash))
            .map_or(0, BTreeSet::len)
    }

    /// Read a previously persisted index, if any.
    ///
    /// # Errors
    ///
    /// Returns an error when the index exists but cannot be read or parsed.
    pub async fn load(&self) -> Result<()> {
        let path = self.index_path();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let index: PieceIndex = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        let restored = index.torrents.len();
        self.write().pieces = index.torrents;
        debug!(torrents = restored, "loaded piece index");
        Ok(())
    }

    /// Write the index when it changed since the last flush.
    ///
    /// # Errors
    ///
    /// Returns an error when the state directory or index file cannot be written.
    pub async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let payload = {
            let registry = self.read();
            serde_json::to_vec_pretty(&PieceIndex {
                torrents: registry.pieces.clone(),
            })?
        };
        if let Err(err) = write_atomically(&self.state_dir, &payload).await {
            self.dirty.store(true, Ordering::Release);
            return Err(err);
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn write_atomically(state_dir: &Path, payload: &[u8]) -> Result<()> {
    tokio::fs::create_dir_all(state_dir)
        .await
        .with_context(|| format!("creating {}", state_dir.display()))?;
    let target = state_dir.join(INDEX_FILE);
    let staging = state_dir.join(format!("{INDEX_FILE}.tmp"));
    tokio::fs::write(&staging, payload)
        .await
        .with_context(|| format!("writing {}", staging.display()))?;
    if let Err(err) = tokio::fs::rename(&staging, &target).await {
        warn!(error = %err, "failed to move piece index into place");
        return Err(err).with_context(|| format!("renaming into {}", target.display()));
    }
    Ok(())
}

fn normalise(info_hash: &str) -> String {
    info_hash.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn overrides_fall_back_to_default_dir() {
        let storage = DynamicStorage::new("/state", "/downloads");
        storage.register("ABCD", "/movies");
        assert_eq!(storage.dir_for("abcd"), PathBuf::from("/movies"));
        assert_eq!(storage.dir_for("ef01"), PathBuf::from("/downloads"));
        storage.unregister("abcd");
        assert_eq!(storage.dir_for("abcd"), PathBuf::from("/downloads"));
    }

    #[tokio::test]
    async fn index_round_trips_through_state_dir() -> Result<()> {
        let state = tempfile::tempdir()?;
        let storage = DynamicStorage::new(state.path(), "/downloads");
        storage.mark_pieces("aa", &[0, 1, 2]);
        storage.mark_pieces("aa", &[2]);
        storage.flush().await?;
        assert!(storage.index_path().exists());

        let reloaded = DynamicStorage::new(state.path(), "/downloads");
        reloaded.load().await?;
        assert_eq!(reloaded.completed_pieces("aa"), 3);
        Ok(())
    }

    #[tokio::test]
    async fn missing_index_loads_empty() -> Result<()> {
        let state = tempfile::tempdir()?;
        let storage = DynamicStorage::new(state.path().join("nested"), "/downloads");
        storage.load().await?;
        assert_eq!(storage.completed_pieces("aa"), 0);
        storage.flush().await?;
        assert!(!storage.index_path().exists());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_registrations_do_not_interfere() {
        let storage = Arc::new(DynamicStorage::new("/state", "/downloads"));
        let mut tasks = Vec::new();
        for n in 0..16_u32 {
            let storage = Arc::clone(&storage);
            tasks.push(tokio::spawn(async move {
                let hash = format!("{n:040x}");
                storage.register(&hash, format!("/dir/{n}"));
                storage.mark_pieces(&hash, &[n]);
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }
        for n in 0..16_u32 {
            let hash = format!("{n:040x}");
            assert_eq!(storage.dir_for(&hash), PathBuf::from(format!("/dir/{n}")));
            assert_eq!(storage.completed_pieces(&hash), 1);
        }
        storage.unregister(&format!("{:040x}", 3));
        storage.register("late", "/late");
        assert!(storage.is_registered("late"));
    }
}
