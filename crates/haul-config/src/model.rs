//! Typed settings model with serde defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const DEFAULT_RPC_URL: &str = "ws://127.0.0.1:6800/jsonrpc";
const DEFAULT_RC_URL: &str = "http://127.0.0.1:5572";
const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
const DEFAULT_STATE_DIR: &str = ".haul/state";

/// Backend choice as written in settings files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    /// External download daemon.
    Remote,
    /// In-process engine.
    InProcess,
}

/// Which backend handles each source kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSelection {
    /// Backend for magnet links and torrent blobs.
    pub torrent_backend: BackendChoice,
    /// Backend for direct URLs.
    pub http_backend: BackendChoice,
}

impl Default for EngineSelection {
    fn default() -> Self {
        Self {
            torrent_backend: BackendChoice::InProcess,
            http_backend: BackendChoice::Remote,
        }
    }
}

/// Optional daemon launch block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aria2Launch {
    /// Executable to spawn.
    pub binary: PathBuf,
    /// Extra command-line arguments.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Remote daemon connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Aria2Settings {
    /// WebSocket JSON-RPC endpoint.
    pub rpc_url: String,
    /// RPC secret token.
    pub secret: Option<String>,
    /// Per-call timeout.
    pub rpc_timeout_secs: u64,
    /// How long startup waits for the daemon to answer.
    pub ready_timeout_secs: u64,
    /// Spawn the daemon ourselves when present.
    pub launch: Option<Aria2Launch>,
    /// Connections per server.
    pub max_connections_per_server: u32,
    /// Segments per download.
    pub split: u32,
    /// Concurrent downloads.
    pub max_concurrent: u32,
}

impl Default for Aria2Settings {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            secret: None,
            rpc_timeout_secs: 10,
            ready_timeout_secs: 5,
            launch: None,
            max_connections_per_server: 16,
            split: 16,
            max_concurrent: 5,
        }
    }
}

/// In-process engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InProcessSettings {
    /// Where payloads land when a task has no directory of its own.
    pub download_dir: PathBuf,
    /// Piece-completion index and other engine state.
    pub state_dir: PathBuf,
    /// Magnet metadata wait.
    pub metadata_timeout_secs: u64,
    /// Throughput sampler cadence.
    pub sample_interval_ms: u64,
    /// Parallel streams for HTTP fetches.
    pub http_streams: u32,
    /// Low-level retries for HTTP fetches.
    pub http_retries: u32,
    /// Proxy for HTTP fetches.
    pub proxy: Option<String>,
    /// Skip TLS verification.
    pub insecure_tls: bool,
    /// User agent override.
    pub user_agent: Option<String>,
    /// Global download cap in bytes per second (zero = unlimited).
    pub download_limit: u64,
}

impl Default for InProcessSettings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            metadata_timeout_secs: 60,
            sample_interval_ms: 2_000,
            http_streams: 4,
            http_retries: 3,
            proxy: None,
            insecure_tls: false,
            user_agent: None,
            download_limit: 0,
        }
    }
}

/// Copy or move when uploading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// Keep the local payload.
    #[default]
    Copy,
    /// Delete the local payload after upload.
    Move,
}

/// Cloud-sync backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSyncSettings {
    /// Remote-control endpoint.
    pub rc_url: String,
    /// Basic-auth user.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Job status poll cadence.
    pub poll_interval_ms: u64,
    /// Copy or move.
    pub upload_mode: UploadMode,
}

impl Default for CloudSyncSettings {
    fn default() -> Self {
        Self {
            rc_url: DEFAULT_RC_URL.to_string(),
            username: None,
            password: None,
            poll_interval_ms: 1_500,
            upload_mode: UploadMode::Copy,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// `PostgreSQL` URL; records stay in memory when absent.
    pub database_url: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormatSetting {
    /// Structured JSON lines.
    Json,
    /// Human-readable output.
    Pretty,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Level or `EnvFilter` directive.
    pub level: String,
    /// Output format; inferred from the build profile when absent.
    pub format: Option<LogFormatSetting>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

/// Root settings document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Backend preference.
    pub engine: EngineSelection,
    /// Remote daemon.
    pub aria2: Aria2Settings,
    /// In-process engine.
    pub inproc: InProcessSettings,
    /// Cloud-sync backend.
    pub cloudsync: CloudSyncSettings,
    /// Persistence.
    pub storage: StorageSettings,
    /// Logging.
    pub telemetry: TelemetrySettings,
}
