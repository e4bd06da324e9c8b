//! Live settings holder with a change feed.
//!
//! # Design
//! - The current settings sit behind a `watch` channel so readers never block writers.
//! - File changes are detected by polling the modification time; reloads that fail
//!   keep the previous settings in place.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::loader::{apply_env, parse_settings};
use crate::model::Settings;

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A published settings revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsChange {
    /// Monotonic revision, starting at zero for the initial load.
    pub revision: u64,
    /// Normalised settings.
    pub settings: Arc<Settings>,
    /// Guard-rail warnings emitted for this revision.
    pub warnings: Vec<String>,
}

/// Stream of settings revisions.
pub struct SettingsStream {
    receiver: watch::Receiver<SettingsChange>,
}

impl SettingsStream {
    /// Wait for the next revision; `None` once the service is gone.
    pub async fn next(&mut self) -> Option<SettingsChange> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }
}

/// Owner of the live settings.
#[derive(Clone)]
pub struct ConfigService {
    path: Option<PathBuf>,
    env: EnvLookup,
    sender: Arc<watch::Sender<SettingsChange>>,
}

impl ConfigService {
    /// Load settings and start holding them.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the initial load fails.
    pub fn new(
        path: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> ConfigResult<Self> {
        let normalised = crate::loader::load_settings(path.as_deref(), &env)?;
        let (sender, _) = watch::channel(SettingsChange {
            revision: 0,
            settings: Arc::new(normalised.settings),
            warnings: normalised.warnings,
        });
        Ok(Self {
            path,
            env: Arc::new(env),
            sender: Arc::new(sender),
        })
    }

    /// Service holding fixed settings, with no backing file.
    #[must_use]
    pub fn fixed(settings: Settings) -> Self {
        let (sender, _) = watch::channel(SettingsChange {
            revision: 0,
            settings: Arc::new(settings),
            warnings: Vec::new(),
        });
        Self {
            path: None,
            env: Arc::new(|_: &str| None),
            sender: Arc::new(sender),
        }
    }

    /// Current settings.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Settings> {
        Arc::clone(&self.sender.borrow().settings)
    }

    /// Subscribe to future revisions.
    #[must_use]
    pub fn subscribe(&self) -> SettingsStream {
        SettingsStream {
            receiver: self.sender.subscribe(),
        }
    }

    /// Replace the settings, publishing a revision when they differ.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the new settings fail validation.
    pub fn apply(&self, settings: Settings) -> ConfigResult<bool> {
        let normalised = settings.normalise()?;
        let changed = self.sender.send_if_modified(|current| {
            if *current.settings == normalised.settings {
                return false;
            }
            current.revision += 1;
            current.settings = Arc::new(normalised.settings.clone());
            current.warnings.clone_from(&normalised.warnings);
            true
        });
        Ok(changed)
    }

    /// Re-read the backing file and apply it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the file cannot be read or parsed.
    pub async fn reload(&self) -> ConfigResult<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.clone(),
                    source,
                });
            }
        };
        let parsed = parse_settings(&contents, path)?;
        let env = Arc::clone(&self.env);
        let merged = apply_env(parsed, move |key| env(key))?;
        self.apply(merged)
    }

    /// Poll the backing file every `every` and reload on modification.
    #[must_use]
    pub fn watch_file(&self, every: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let Some(path) = service.path.clone() else {
                return;
            };
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_seen = modified(&path).await;
            loop {
                ticker.tick().await;
                let current = modified(&path).await;
                if current == last_seen {
                    continue;
                }
                last_seen = current;
                match service.reload().await {
                    Ok(true) => info!(path = %path.display(), "settings reloaded"),
                    Ok(false) => {}
                    Err(err) => warn!(
                        error = %err,
                        path = %path.display(),
                        "settings reload failed; keeping previous settings"
                    ),
                }
            }
        })
    }
}

async fn modified(path: &std::path::Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn apply_publishes_only_real_changes() -> anyhow::Result<()> {
        let service = ConfigService::fixed(Settings::default());
        let mut stream = service.subscribe();

        assert!(!service.apply(Settings::default())?);

        let mut next = Settings::default();
        next.inproc.http_streams = 9;
        assert!(service.apply(next)?);

        let change = timeout(Duration::from_secs(1), stream.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("stream closed"))?;
        assert_eq!(change.revision, 1);
        assert_eq!(change.settings.inproc.http_streams, 9);
        assert_eq!(service.snapshot().inproc.http_streams, 9);
        Ok(())
    }

    #[tokio::test]
    async fn reload_reads_file_changes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("haul.json");
        std::fs::write(&path, r#"{"inproc":{"http_retries":2}}"#)?;
        let service = ConfigService::new(Some(path.clone()), |_| None)?;
        assert_eq!(service.snapshot().inproc.http_retries, 2);

        std::fs::write(&path, r#"{"inproc":{"http_retries":5}}"#)?;
        assert!(service.reload().await?);
        assert_eq!(service.snapshot().inproc.http_retries, 5);

        std::fs::write(&path, "{broken")?;
        assert!(service.reload().await.is_err());
        assert_eq!(service.snapshot().inproc.http_retries, 5);
        Ok(())
    }
}
