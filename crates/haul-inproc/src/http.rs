//! Direct HTTP transfers delegated to the cloud-sync copy-by-URL operation.

use std::any::Any;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use haul_core::{
    CloudSync, CloudSyncError, CopyRequest, EngineEventKind, EngineHandle, TransferConfig,
    TransferProgress,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tracker::Tracker;

const FALLBACK_FILENAME: &str = "download";

/// Fresh per-task transfer settings: engine defaults plus request headers.
pub(crate) fn transfer_for(
    defaults: &TransferConfig,
    headers: &BTreeMap<String, String>,
    max_connections: Option<u32>,
) -> TransferConfig {
    let mut transfer = defaults.clone();
    for (key, value) in headers {
        transfer.headers.insert(key.clone(), value.clone());
    }
    if let Some(connections) = max_connections.filter(|n| *n > 0) {
        transfer.streams = connections;
    }
    transfer
}

/// Filename from the last path segment of `url`.
pub(crate) fn filename_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let after_scheme = path.split_once("://").map_or(path, |(_, rest)| rest);
    after_scheme
        .split_once('/')
        .and_then(|(_, tail)| tail.rsplit('/').find(|segment| !segment.is_empty()))
        .map_or_else(|| FALLBACK_FILENAME.to_string(), str::to_string)
}

/// Run one copy-by-URL transfer in its own task.
///
/// A panic inside the cloud-sync call becomes a failure event for the handle.
pub(crate) fn spawn_transfer(
    cloud: Arc<dyn CloudSync>,
    tracker: Arc<Tracker>,
    wake: Arc<Notify>,
    handle: EngineHandle,
    request: CopyRequest,
    progress: TransferProgress,
    cancel: CancellationToken,
) {
    wake.notify_one();
    tokio::spawn(async move {
        let transfer = {
            let cancel = cancel.clone();
            tokio::spawn(async move { cloud.copy_by_url(&request, &progress, cancel).await })
        };
        let outcome = match transfer.await {
            Ok(Ok(path)) => Ok(path),
            Ok(Err(CloudSyncError::Cancelled)) => {
                debug!(handle = %handle, "http transfer stopped");
                return;
            }
            Ok(Err(err)) => Err(err.detail()),
            Err(join) if join.is_panic() => {
                let message = panic_message(join.into_panic().as_ref());
                warn!(handle = %handle, panic = %message, "http transfer panicked");
                Err(format!("http transfer panicked: {message}"))
            }
            Err(join) => Err(format!("http transfer aborted: {join}")),
        };
        if cancel.is_cancelled() {
            // paused or cancelled while the copy was finishing
            debug!(handle = %handle, "discarding outcome of stopped transfer");
            return;
        }
        match outcome {
            Ok(path) => {
                if tracker
                    .finish(&handle, EngineEventKind::Completed { path: path.clone() })
                    .is_some()
                {
                    info!(handle = %handle, path = %path.display(), "http download completed");
                }
            }
            Err(message) => {
                if tracker
                    .finish(&handle, EngineEventKind::Failed { message: message.clone() })
                    .is_some()
                {
                    warn!(handle = %handle, error = %message, "http download failed");
                }
            }
        }
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Best-effort removal of a fetched file.
pub(crate) async fn delete_file(path: PathBuf) {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => debug!(path = %path.display(), "deleted http payload"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to delete http payload"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_come_from_last_segment() {
        assert_eq!(filename_from_url("https://h/a/b/file.iso?x=1"), "file.iso");
        assert_eq!(filename_from_url("https://h/a/dir/"), "dir");
        assert_eq!(filename_from_url("https://h"), FALLBACK_FILENAME);
        assert_eq!(filename_from_url("https://h/#frag"), FALLBACK_FILENAME);
    }

    #[test]
    fn transfer_merges_headers_and_connection_cap() {
        let mut defaults = TransferConfig {
            streams: 4,
            retries: 3,
            ..TransferConfig::default()
        };
        defaults.headers.insert("User-Agent".into(), "haul".into());
        let mut headers = BTreeMap::new();
        headers.insert("Cookie".into(), "a=b".into());
        let transfer = transfer_for(&defaults, &headers, Some(8));
        assert_eq!(transfer.streams, 8);
        assert_eq!(transfer.retries, 3);
        assert_eq!(transfer.headers.len(), 2);
        assert_eq!(transfer_for(&defaults, &headers, Some(0)).streams, 4);
    }

    #[test]
    fn panic_payloads_render() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
