//! Translate loaded settings into the configuration each component takes.

use std::time::Duration;

use haul_aria2::{Aria2Config, LaunchConfig};
use haul_config::{BackendChoice, Settings, UploadMode};
use haul_core::{Backend, EngineSettings, TransferConfig};
use haul_inproc::InProcessConfig;
use haul_rclone::RcloneConfig;
use reqwest::Url;

use crate::upload::UploadConfig;

const DEFAULT_RPC_PORT: u16 = 6800;
const ARIA2_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RCLONE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine-facing backend for a configured choice.
#[must_use]
pub const fn backend(choice: BackendChoice) -> Backend {
    match choice {
        BackendChoice::Remote => Backend::Remote,
        BackendChoice::InProcess => Backend::InProcess,
    }
}

/// Settings pushed into the router and both engines.
#[must_use]
pub fn engine_settings(settings: &Settings) -> EngineSettings {
    EngineSettings {
        torrent_backend: backend(settings.engine.torrent_backend),
        http_backend: backend(settings.engine.http_backend),
        download_dir: settings.inproc.download_dir.clone(),
        max_concurrent: settings.aria2.max_concurrent,
        max_connections_per_server: settings.aria2.max_connections_per_server,
        split: settings.aria2.split,
        download_limit: settings.inproc.download_limit,
        metadata_timeout: Duration::from_secs(settings.inproc.metadata_timeout_secs),
        http_streams: settings.inproc.http_streams,
        http_retries: settings.inproc.http_retries,
        proxy: settings.inproc.proxy.clone(),
        insecure_tls: settings.inproc.insecure_tls,
        user_agent: settings.inproc.user_agent.clone(),
    }
}

/// Remote engine knobs, including the daemon launch line when configured.
#[must_use]
pub fn aria2_config(settings: &Settings) -> Aria2Config {
    let aria2 = &settings.aria2;
    let launch = aria2.launch.as_ref().map(|launch| LaunchConfig {
        binary: launch.binary.clone(),
        rpc_port: rpc_port(&aria2.rpc_url),
        secret: aria2.secret.clone(),
        download_dir: settings.inproc.download_dir.clone(),
        extra_args: launch.extra_args.clone(),
    });
    Aria2Config {
        poll_interval: ARIA2_POLL_INTERVAL,
        ready_timeout: Duration::from_secs(aria2.ready_timeout_secs),
        launch,
    }
}

/// In-process engine knobs.
#[must_use]
pub fn inproc_config(settings: &Settings) -> InProcessConfig {
    let inproc = &settings.inproc;
    InProcessConfig {
        download_dir: inproc.download_dir.clone(),
        metadata_timeout: Duration::from_secs(inproc.metadata_timeout_secs),
        sample_interval: Duration::from_millis(inproc.sample_interval_ms),
        transfer: TransferConfig {
            proxy: inproc.proxy.clone(),
            streams: inproc.http_streams,
            retries: inproc.http_retries,
            insecure_tls: inproc.insecure_tls,
            user_agent: inproc.user_agent.clone(),
            ..TransferConfig::default()
        },
        download_limit: inproc.download_limit,
    }
}

/// rclone rc connection.
#[must_use]
pub fn rclone_config(settings: &Settings) -> RcloneConfig {
    let cloud = &settings.cloudsync;
    RcloneConfig {
        rc_url: cloud.rc_url.clone(),
        username: cloud.username.clone(),
        password: cloud.password.clone(),
        poll_interval: Duration::from_millis(cloud.poll_interval_ms),
        request_timeout: RCLONE_REQUEST_TIMEOUT,
    }
}

/// Upload service knobs.
#[must_use]
pub fn upload_config(settings: &Settings) -> UploadConfig {
    UploadConfig {
        poll_interval: Duration::from_millis(settings.cloudsync.poll_interval_ms),
        delete_source: settings.cloudsync.upload_mode == UploadMode::Move,
    }
}

fn rpc_port(rpc_url: &str) -> u16 {
    Url::parse(rpc_url)
        .ok()
        .and_then(|url| url.port())
        .unwrap_or(DEFAULT_RPC_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haul_config::Aria2Launch;
    use std::path::PathBuf;

    #[test]
    fn defaults_prefer_in_process_torrents() {
        let settings = engine_settings(&Settings::default());
        assert_eq!(settings.torrent_backend, Backend::InProcess);
        assert_eq!(settings.http_backend, Backend::Remote);
        assert_eq!(settings.max_connections_per_server, 16);
    }

    #[test]
    fn launch_line_takes_the_port_from_the_rpc_url() {
        let mut settings = Settings::default();
        settings.aria2.rpc_url = "ws://127.0.0.1:6900/jsonrpc".into();
        settings.aria2.secret = Some("token".into());
        settings.aria2.launch = Some(Aria2Launch {
            binary: PathBuf::from("/usr/bin/aria2c"),
            extra_args: vec!["--quiet".into()],
        });
        let config = aria2_config(&settings);
        let launch = config.launch.expect("launch configured");
        assert_eq!(launch.rpc_port, 6900);
        assert_eq!(launch.secret.as_deref(), Some("token"));
        assert_eq!(launch.download_dir, settings.inproc.download_dir);
    }

    #[test]
    fn portless_rpc_urls_use_the_daemon_default() {
        assert_eq!(rpc_port("ws://localhost/jsonrpc"), DEFAULT_RPC_PORT);
        assert_eq!(rpc_port("not a url"), DEFAULT_RPC_PORT);
    }

    #[test]
    fn move_mode_deletes_the_source() {
        let mut settings = Settings::default();
        assert!(!upload_config(&settings).delete_source);
        settings.cloudsync.upload_mode = UploadMode::Move;
        assert!(upload_config(&settings).delete_source);
    }

    #[test]
    fn transfer_defaults_follow_inproc_settings() {
        let mut settings = Settings::default();
        settings.inproc.proxy = Some("http://proxy:3128".into());
        settings.inproc.http_streams = 8;
        let config = inproc_config(&settings);
        assert_eq!(config.transfer.proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(config.transfer.streams, 8);
        assert!(config.transfer.headers.is_empty());
    }
}
