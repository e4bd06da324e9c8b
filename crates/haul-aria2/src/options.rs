//! Translation of engine options into aria2's option vocabulary.

use haul_core::{EngineSettings, SubmitOptions};
use serde_json::{Map, Value};

/// Per-download options for `aria2.addUri` / `aria2.addTorrent`.
#[must_use]
pub fn download_options(options: &SubmitOptions) -> Map<String, Value> {
    let mut out = Map::new();
    if !options.headers.is_empty() {
        let headers: Vec<Value> = options
            .headers
            .iter()
            .map(|(name, value)| Value::from(format!("{name}: {value}")))
            .collect();
        out.insert("header".into(), Value::Array(headers));
    }
    if let Some(dir) = &options.directory {
        out.insert("dir".into(), Value::from(dir.to_string_lossy().into_owned()));
    }
    if let Some(filename) = options.filename.as_deref().filter(|name| !name.is_empty()) {
        out.insert("out".into(), Value::from(filename));
    }
    if let Some(limit) = options.max_download_speed.filter(|limit| *limit > 0) {
        out.insert("max-download-limit".into(), Value::from(limit.to_string()));
    }
    if let Some(connections) = options.max_connections.filter(|count| *count > 0) {
        let connections = connections.min(16).to_string();
        out.insert("max-connection-per-server".into(), Value::from(connections.clone()));
        out.insert("split".into(), Value::from(connections));
    }
    if !options.selected_files.is_empty() {
        let selection = options
            .selected_files
            .iter()
            .map(|index| (index + 1).to_string())
            .collect::<Vec<_>>()
            .join(",");
        out.insert("select-file".into(), Value::from(selection));
    }
    out
}

/// Global options pushed through `aria2.changeGlobalOption`.
#[must_use]
pub fn global_options(settings: &EngineSettings) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert(
        "max-concurrent-downloads".into(),
        Value::from(settings.max_concurrent.max(1).to_string()),
    );
    out.insert(
        "max-connection-per-server".into(),
        Value::from(settings.max_connections_per_server.clamp(1, 16).to_string()),
    );
    out.insert("split".into(), Value::from(settings.split.max(1).to_string()));
    out.insert(
        "max-overall-download-limit".into(),
        Value::from(settings.download_limit.to_string()),
    );
    out.insert(
        "dir".into(),
        Value::from(settings.download_dir.to_string_lossy().into_owned()),
    );
    out
}
