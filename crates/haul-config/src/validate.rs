//! Guard-rail validation and normalisation.
//!
//! # Design
//! - Hard errors only for values nothing can be derived from (bad URL schemes).
//! - Out-of-range numbers are clamped and reported as warnings.

use crate::error::{ConfigError, ConfigResult};
use crate::model::Settings;

const METADATA_TIMEOUT_RANGE: (u64, u64) = (5, 3_600);
const SAMPLE_INTERVAL_RANGE: (u64, u64) = (250, 10_000);
const POLL_INTERVAL_RANGE: (u64, u64) = (500, 10_000);
const STREAMS_RANGE: (u32, u32) = (1, 32);
const CONNECTIONS_RANGE: (u32, u32) = (1, 16);
const MAX_RETRIES: u32 = 10;

/// Settings after clamping, plus the warnings produced on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalised {
    /// Sanitised settings.
    pub settings: Settings,
    /// One entry per clamp applied.
    pub warnings: Vec<String>,
}

impl Settings {
    /// Validate and clamp every section.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidField` when a URL uses the wrong scheme.
    pub fn normalise(self) -> ConfigResult<Normalised> {
        let mut settings = self;
        let mut warnings = Vec::new();

        if !(settings.aria2.rpc_url.starts_with("ws://")
            || settings.aria2.rpc_url.starts_with("wss://"))
        {
            return Err(ConfigError::InvalidField {
                section: "aria2",
                field: "rpc_url",
                message: format!("'{}' must use ws:// or wss://", settings.aria2.rpc_url),
            });
        }
        if !(settings.cloudsync.rc_url.starts_with("http://")
            || settings.cloudsync.rc_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidField {
                section: "cloudsync",
                field: "rc_url",
                message: format!("'{}' must use http:// or https://", settings.cloudsync.rc_url),
            });
        }

        let aria2 = &mut settings.aria2;
        aria2.rpc_timeout_secs = at_least(aria2.rpc_timeout_secs, 1, "aria2.rpc_timeout_secs", &mut warnings);
        aria2.ready_timeout_secs =
            at_least(aria2.ready_timeout_secs, 1, "aria2.ready_timeout_secs", &mut warnings);
        aria2.max_connections_per_server = clamp(
            aria2.max_connections_per_server,
            CONNECTIONS_RANGE,
            "aria2.max_connections_per_server",
            &mut warnings,
        );
        aria2.split = at_least(aria2.split, 1, "aria2.split", &mut warnings);
        aria2.max_concurrent = at_least(aria2.max_concurrent, 1, "aria2.max_concurrent", &mut warnings);

        let inproc = &mut settings.inproc;
        inproc.metadata_timeout_secs = clamp(
            inproc.metadata_timeout_secs,
            METADATA_TIMEOUT_RANGE,
            "inproc.metadata_timeout_secs",
            &mut warnings,
        );
        inproc.sample_interval_ms = clamp(
            inproc.sample_interval_ms,
            SAMPLE_INTERVAL_RANGE,
            "inproc.sample_interval_ms",
            &mut warnings,
        );
        inproc.http_streams =
            clamp(inproc.http_streams, STREAMS_RANGE, "inproc.http_streams", &mut warnings);
        if inproc.http_retries > MAX_RETRIES {
            warnings.push(format!(
                "inproc.http_retries clamped from {} to {MAX_RETRIES}",
                inproc.http_retries
            ));
            inproc.http_retries = MAX_RETRIES;
        }

        settings.cloudsync.poll_interval_ms = clamp(
            settings.cloudsync.poll_interval_ms,
            POLL_INTERVAL_RANGE,
            "cloudsync.poll_interval_ms",
            &mut warnings,
        );

        Ok(Normalised { settings, warnings })
    }
}

fn clamp<T>(value: T, (min, max): (T, T), field: &str, warnings: &mut Vec<String>) -> T
where
    T: Ord + Copy + std::fmt::Display,
{
    let clamped = value.clamp(min, max);
    if clamped != value {
        warnings.push(format!("{field} clamped from {value} to {clamped}"));
    }
    clamped
}

fn at_least<T>(value: T, min: T, field: &str, warnings: &mut Vec<String>) -> T
where
    T: Ord + Copy + std::fmt::Display,
{
    if value < min {
        warnings.push(format!("{field} raised from {value} to {min}"));
        min
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_without_warnings() {
        let normalised = Settings::default().normalise().expect("defaults are valid");
        assert!(normalised.warnings.is_empty());
        assert_eq!(normalised.settings, Settings::default());
    }

    #[test]
    fn out_of_range_values_are_clamped_with_warnings() {
        let mut settings = Settings::default();
        settings.inproc.metadata_timeout_secs = 1;
        settings.inproc.http_streams = 99;
        settings.inproc.http_retries = 50;
        settings.aria2.rpc_timeout_secs = 0;
        let normalised = settings.normalise().expect("clamped");
        assert_eq!(normalised.settings.inproc.metadata_timeout_secs, 5);
        assert_eq!(normalised.settings.inproc.http_streams, 32);
        assert_eq!(normalised.settings.inproc.http_retries, 10);
        assert_eq!(normalised.settings.aria2.rpc_timeout_secs, 1);
        assert_eq!(normalised.warnings.len(), 4);
    }

    #[test]
    fn wrong_url_scheme_is_an_error() {
        let mut settings = Settings::default();
        settings.aria2.rpc_url = "http://127.0.0.1:6800/jsonrpc".into();
        assert!(matches!(
            settings.normalise(),
            Err(ConfigError::InvalidField {
                field: "rpc_url",
                ..
            })
        ));
    }
}
