//! Settings loading: JSON file first, then `HAUL_*` environment overrides.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::model::{BackendChoice, LogFormatSetting, Settings};
use crate::validate::Normalised;

/// Prefix shared by every override variable.
pub const ENV_PREFIX: &str = "HAUL_";

/// Environment lookup backed by the process environment.
#[must_use]
pub fn process_env() -> impl Fn(&str) -> Option<String> {
    |key| std::env::var(key).ok()
}

/// Load settings from `path` (defaults when absent), apply overrides from `env`,
/// and normalise.
///
/// # Errors
///
/// Returns `ConfigError` when the file exists but cannot be read or parsed, or
/// when an override or the merged result fails validation.
pub fn load_settings(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> ConfigResult<Normalised> {
    let base = match path {
        Some(path) => read_file(path)?,
        None => Settings::default(),
    };
    let settings = apply_env(base, env)?;
    let normalised = settings.normalise()?;
    for warning in &normalised.warnings {
        warn!(warning = %warning, "settings guard rail applied");
    }
    Ok(normalised)
}

/// Parse a settings document held in memory.
///
/// # Errors
///
/// Returns `ConfigError::Parse` when `contents` is not a valid settings document.
pub fn parse_settings(contents: &str, path: &Path) -> ConfigResult<Settings> {
    serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn read_file(path: &Path) -> ConfigResult<Settings> {
    match fs::read_to_string(path) {
        Ok(contents) => parse_settings(&contents, path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "settings file missing; using defaults");
            Ok(Settings::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub(crate) fn apply_env(
    mut settings: Settings,
    env: impl Fn(&str) -> Option<String>,
) -> ConfigResult<Settings> {
    let var = |name: &str| env(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());

    if let Some(url) = var("ARIA2_RPC_URL") {
        settings.aria2.rpc_url = url;
    }
    if let Some(secret) = var("ARIA2_SECRET") {
        settings.aria2.secret = Some(secret);
    }
    if let Some(url) = var("DATABASE_URL") {
        settings.storage.database_url = Some(url);
    }
    if let Some(dir) = var("DOWNLOAD_DIR") {
        settings.inproc.download_dir = PathBuf::from(dir);
    }
    if let Some(url) = var("RCLONE_URL") {
        settings.cloudsync.rc_url = url;
    }
    if let Some(value) = var("TORRENT_BACKEND") {
        settings.engine.torrent_backend = parse_backend(&value, "torrent_backend")?;
    }
    if let Some(value) = var("HTTP_BACKEND") {
        settings.engine.http_backend = parse_backend(&value, "http_backend")?;
    }
    if let Some(level) = var("LOG_LEVEL") {
        settings.telemetry.level = level;
    }
    if let Some(format) = var("LOG_FORMAT") {
        settings.telemetry.format = match format.to_ascii_lowercase().as_str() {
            "json" => Some(LogFormatSetting::Json),
            "pretty" => Some(LogFormatSetting::Pretty),
            _ => {
                return Err(ConfigError::InvalidField {
                    section: "telemetry",
                    field: "format",
                    message: format!("unknown log format '{format}'"),
                });
            }
        };
    }
    Ok(settings)
}

fn parse_backend(value: &str, field: &'static str) -> ConfigResult<BackendChoice> {
    match value.trim().to_ascii_lowercase().as_str() {
        "remote" | "aria2" => Ok(BackendChoice::Remote),
        "in_process" | "inproc" | "native" => Ok(BackendChoice::InProcess),
        other => Err(ConfigError::InvalidField {
            section: "engine",
            field,
            message: format!("unknown backend '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_file_yields_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let normalised = load_settings(Some(&dir.path().join("absent.json")), env_from(&[]))?;
        assert_eq!(normalised.settings, Settings::default());
        Ok(())
    }

    #[test]
    fn file_values_are_overridden_by_env() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"aria2":{{"secret":"from-file"}},"inproc":{{"http_streams":8}}}}"#
        )?;
        let env = env_from(&[
            ("HAUL_ARIA2_SECRET", "from-env"),
            ("HAUL_HTTP_BACKEND", "inproc"),
            ("HAUL_DATABASE_URL", "postgres://db/haul"),
        ]);
        let settings = load_settings(Some(file.path()), env)?.settings;
        assert_eq!(settings.aria2.secret.as_deref(), Some("from-env"));
        assert_eq!(settings.inproc.http_streams, 8);
        assert_eq!(settings.engine.http_backend, BackendChoice::InProcess);
        assert_eq!(
            settings.storage.database_url.as_deref(),
            Some("postgres://db/haul")
        );
        Ok(())
    }

    #[test]
    fn malformed_file_reports_parse_error() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "{{not json")?;
        let err = load_settings(Some(file.path()), env_from(&[])).expect_err("parse error");
        assert!(matches!(err, ConfigError::Parse { .. }));
        Ok(())
    }

    #[test]
    fn unknown_backend_override_is_rejected() {
        let err = apply_env(Settings::default(), env_from(&[("HAUL_TORRENT_BACKEND", "bogus")]))
            .expect_err("invalid backend");
        assert!(matches!(
            err,
            ConfigError::InvalidField {
                field: "torrent_backend",
                ..
            }
        ));
    }
}
