#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! File- and environment-backed settings for the haul orchestrator.
//!
//! Layout: `model.rs` (typed settings and defaults), `validate.rs` (guard-rail
//! normalisation), `loader.rs` (JSON file plus `HAUL_*` overrides), `service.rs`
//! (`ConfigService` + `SettingsStream` change feed).

pub mod error;
pub mod loader;
pub mod model;
pub mod service;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ENV_PREFIX, load_settings, process_env};
pub use model::{
    Aria2Launch, Aria2Settings, BackendChoice, CloudSyncSettings, EngineSelection,
    InProcessSettings, LogFormatSetting, Settings, StorageSettings, TelemetrySettings,
    UploadMode,
};
pub use service::{ConfigService, SettingsChange, SettingsStream};
pub use validate::Normalised;
