use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use haul_aria2::{Aria2Config, Aria2Engine, Aria2Rpc, RpcError, RpcResult, VANISHED_MESSAGE};
use haul_core::{
    EngineError, EngineEventKind, EngineEventReceiver, EngineHandle, EngineSettings, RemoveOptions,
    SubmitRequest, TaskEngine, TaskSource, TaskStatus, engine_events,
};
use serde_json::{Value, json};
use tokio::time::timeout;

/// Scripted daemon: lists are edited by the test, calls are recorded.
#[derive(Default)]
struct FakeDaemon {
    state: Mutex<DaemonState>,
}

#[derive(Default)]
struct DaemonState {
    next_gid: u64,
    active: Vec<Value>,
    waiting: Vec<Value>,
    stopped: Vec<Value>,
    calls: Vec<(String, Vec<Value>)>,
    failing: HashSet<&'static str>,
    down: bool,
}

impl FakeDaemon {
    fn with<R>(&self, f: impl FnOnce(&mut DaemonState) -> R) -> R {
        let mut state = self.state.lock().expect("daemon state");
        f(&mut state)
    }

    fn calls_to(&self, method: &str) -> Vec<Vec<Value>> {
        self.with(|state| {
            state
                .calls
                .iter()
                .filter(|(name, _)| name == method)
                .map(|(_, params)| params.clone())
                .collect()
        })
    }
}

fn entry(gid: &str, status: &str, dir: &str, completed: u64) -> Value {
    json!({
        "gid": gid,
        "status": status,
        "totalLength": "1000",
        "completedLength": completed.to_string(),
        "downloadSpeed": "100",
        "dir": dir,
        "files": [{"index": "1", "path": format!("{dir}/{gid}.bin"), "length": "1000",
                   "completedLength": completed.to_string(), "selected": "true"}]
    })
}

#[async_trait]
impl Aria2Rpc for FakeDaemon {
    async fn call(&self, method: &'static str, params: Vec<Value>) -> RpcResult<Value> {
        self.with(|state| -> RpcResult<Value> {
            state.calls.push((method.to_string(), params.clone()));
            if state.down || state.failing.contains(method) {
                return Err(RpcError::Daemon {
                    method,
                    code: 1,
                    message: "scripted failure".into(),
                });
            }
            let gid_param = params.first().and_then(Value::as_str).unwrap_or_default().to_string();
            let value = match method {
                "aria2.getVersion" => json!({"version": "1.37.0"}),
                "aria2.addUri" | "aria2.addTorrent" => {
                    state.next_gid += 1;
                    let gid = format!("{:016x}", state.next_gid);
                    state.waiting.push(entry(&gid, "waiting", "/downloads", 0));
                    Value::from(gid)
                }
                "aria2.tellActive" => Value::Array(state.active.clone()),
                "aria2.tellWaiting" => Value::Array(state.waiting.clone()),
                "aria2.tellStopped" => Value::Array(state.stopped.clone()),
                "aria2.tellStatus" => state
                    .active
                    .iter()
                    .chain(&state.waiting)
                    .chain(&state.stopped)
                    .find(|item| item["gid"] == gid_param.as_str())
                    .cloned()
                    .ok_or(RpcError::Daemon {
                        method,
                        code: 1,
                        message: format!("GID {gid_param} is not found"),
                    })?,
                "aria2.forceRemove" => {
                    for list in [&mut state.active, &mut state.waiting] {
                        list.retain(|item| item["gid"] != gid_param.as_str());
                    }
                    state
                        .stopped
                        .push(entry(&gid_param, "removed", "/downloads", 0));
                    Value::from(gid_param)
                }
                "aria2.removeDownloadResult" => {
                    state.stopped.retain(|item| item["gid"] != gid_param.as_str());
                    Value::from("OK")
                }
                _ => Value::from("OK"),
            };
            Ok(value)
        })
    }
}

fn engine(daemon: &Arc<FakeDaemon>) -> (Aria2Engine, EngineEventReceiver) {
    let (events, rx) = engine_events();
    let config = Aria2Config {
        poll_interval: Duration::from_millis(20),
        ready_timeout: Duration::from_millis(300),
        launch: None,
    };
    let rpc: Arc<dyn Aria2Rpc> = daemon.clone();
    (Aria2Engine::new(rpc, events, config), rx)
}

fn url_request() -> Result<SubmitRequest> {
    Ok(SubmitRequest::new(TaskSource::classify(
        "https://example.com/file.iso",
    )?))
}

fn move_to(daemon: &FakeDaemon, gid: &str, status: &str, dir: &str, completed: u64) {
    daemon.with(|state| {
        for list in [&mut state.active, &mut state.waiting, &mut state.stopped] {
            list.retain(|item| item["gid"] != gid);
        }
        let item = entry(gid, status, dir, completed);
        match status {
            "active" => state.active.push(item),
            "waiting" | "paused" => state.waiting.push(item),
            _ => state.stopped.push(item),
        }
    });
}

async fn next_event(rx: &mut EngineEventReceiver) -> Result<haul_core::EngineEvent> {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .context("timed out waiting for engine event")?
        .context("engine event channel closed")
}

async fn assert_quiet(rx: &mut EngineEventReceiver) {
    let extra = timeout(Duration::from_millis(150), rx.recv()).await;
    assert!(extra.is_err(), "unexpected event: {extra:?}");
}

#[tokio::test]
async fn progress_then_exactly_one_completion() -> Result<()> {
    let daemon = Arc::new(FakeDaemon::default());
    let (engine, mut rx) = engine(&daemon);
    engine.start().await?;

    let handle = engine.submit(url_request()?).await?;
    move_to(&daemon, handle.as_str(), "active", "/downloads", 400);

    let progress = loop {
        let event = next_event(&mut rx).await?;
        if let EngineEventKind::Progress(sample) = event.kind {
            break sample;
        }
    };
    assert_eq!(progress.downloaded, 400);
    assert_eq!(progress.eta_seconds, Some(6));

    move_to(&daemon, handle.as_str(), "complete", "/downloads", 1_000);
    let done = loop {
        let event = next_event(&mut rx).await?;
        if event.is_terminal() {
            break event;
        }
    };
    assert_eq!(done.handle, handle);
    assert_eq!(
        done.kind,
        EngineEventKind::Completed {
            path: format!("/downloads/{handle}.bin").into()
        }
    );

    // the stopped entry stays in the daemon's list; later polls stay silent
    assert_quiet(&mut rx).await;
    engine.stop().await?;
    Ok(())
}

#[tokio::test]
async fn daemon_error_becomes_failure_event() -> Result<()> {
    let daemon = Arc::new(FakeDaemon::default());
    let (engine, mut rx) = engine(&daemon);
    engine.start().await?;
    let handle = engine.submit(url_request()?).await?;
    daemon.with(|state| {
        state.waiting.clear();
        let mut failed = entry(handle.as_str(), "error", "/downloads", 0);
        failed["errorCode"] = json!("3");
        failed["errorMessage"] = json!("Resource not found");
        state.stopped.push(failed);
    });
    let event = next_event(&mut rx).await?;
    assert_eq!(
        event.kind,
        EngineEventKind::Failed {
            message: "Resource not found".into()
        }
    );
    engine.stop().await?;
    Ok(())
}

#[tokio::test]
async fn submit_failure_surfaces_to_caller() -> Result<()> {
    let daemon = Arc::new(FakeDaemon::default());
    daemon.with(|state| state.failing.insert("aria2.addUri"));
    let (engine, _rx) = engine(&daemon);
    let err = engine
        .submit(url_request()?)
        .await
        .expect_err("scripted failure");
    assert!(matches!(err, EngineError::Rejected { operation: "aria2.addUri", .. }));
    Ok(())
}

#[tokio::test]
async fn submit_maps_options_for_daemon() -> Result<()> {
    let daemon = Arc::new(FakeDaemon::default());
    let (engine, _rx) = engine(&daemon);
    let mut request = SubmitRequest::new(TaskSource::classify(
        "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567",
    )?);
    request.options.selected_files = vec![1];
    engine.submit(request).await?;

    let calls = daemon.calls_to("aria2.addUri");
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0][0],
        json!(["magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567"])
    );
    assert_eq!(calls[0][1]["select-file"], "2");
    Ok(())
}

#[tokio::test]
async fn cancelled_handle_never_reports() -> Result<()> {
    let daemon = Arc::new(FakeDaemon::default());
    let (engine, mut rx) = engine(&daemon);
    engine.start().await?;
    let handle = engine.submit(url_request()?).await?;
    engine.cancel(&handle).await?;
    assert_eq!(daemon.calls_to("aria2.forceRemove").len(), 1);
    assert_quiet(&mut rx).await;
    engine.stop().await?;
    Ok(())
}

#[tokio::test]
async fn vanished_handle_fails_once() -> Result<()> {
    let daemon = Arc::new(FakeDaemon::default());
    let (engine, mut rx) = engine(&daemon);
    engine.start().await?;
    let handle = engine.submit(url_request()?).await?;
    daemon.with(|state| state.waiting.clear());

    let event = next_event(&mut rx).await?;
    assert_eq!(event.handle, handle);
    assert_eq!(
        event.kind,
        EngineEventKind::Failed {
            message: VANISHED_MESSAGE.into()
        }
    );
    assert_quiet(&mut rx).await;
    engine.stop().await?;
    Ok(())
}

#[tokio::test]
async fn pause_resume_and_status_use_daemon_calls() -> Result<()> {
    let daemon = Arc::new(FakeDaemon::default());
    let (engine, _rx) = engine(&daemon);
    let handle = engine.submit(url_request()?).await?;
    engine.pause(&handle).await?;
    engine.resume(&handle).await?;
    assert_eq!(daemon.calls_to("aria2.forcePause").len(), 1);
    assert_eq!(daemon.calls_to("aria2.unpause").len(), 1);

    move_to(&daemon, handle.as_str(), "paused", "/downloads", 10);
    let snapshot = engine.status(&handle).await?;
    assert_eq!(snapshot.status, TaskStatus::Paused);
    assert_eq!(snapshot.downloaded, 10);

    let missing = engine.status(&EngineHandle::new("ffff")).await;
    assert!(matches!(missing, Err(EngineError::UnknownHandle { .. })));
    Ok(())
}

#[tokio::test]
async fn list_covers_all_three_queues() -> Result<()> {
    let daemon = Arc::new(FakeDaemon::default());
    let (engine, _rx) = engine(&daemon);
    move_to(&daemon, "a", "active", "/d", 1);
    move_to(&daemon, "b", "paused", "/d", 1);
    move_to(&daemon, "c", "complete", "/d", 1_000);

    let mut handles: Vec<String> = engine
        .list()
        .await?
        .into_iter()
        .map(|snapshot| snapshot.handle.to_string())
        .collect();
    handles.sort();
    assert_eq!(handles, vec!["a", "b", "c"]);
    Ok(())
}

#[tokio::test]
async fn configure_pushes_global_options() -> Result<()> {
    let daemon = Arc::new(FakeDaemon::default());
    let (engine, _rx) = engine(&daemon);
    let settings = EngineSettings {
        max_concurrent: 3,
        ..EngineSettings::default()
    };
    engine.configure(&settings).await?;
    let calls = daemon.calls_to("aria2.changeGlobalOption");
    assert_eq!(calls[0][0]["max-concurrent-downloads"], "3");
    assert_eq!(engine.version().await?, "aria2 1.37.0");
    Ok(())
}

#[tokio::test]
async fn remove_with_files_deletes_payload() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dir_str = dir.path().to_string_lossy().into_owned();
    let daemon = Arc::new(FakeDaemon::default());
    let (engine, _rx) = engine(&daemon);
    let handle = engine.submit(url_request()?).await?;
    move_to(&daemon, handle.as_str(), "complete", &dir_str, 1_000);
    let payload = dir.path().join(format!("{handle}.bin"));
    std::fs::write(&payload, b"data")?;

    engine
        .remove(&handle, RemoveOptions { delete_files: true })
        .await?;
    assert!(!payload.exists());
    assert!(!daemon.calls_to("aria2.removeDownloadResult").is_empty());
    Ok(())
}

#[tokio::test]
async fn start_fails_when_daemon_never_answers() {
    let daemon = Arc::new(FakeDaemon::default());
    daemon.with(|state| state.down = true);
    let (engine, _rx) = engine(&daemon);
    let err = engine.start().await.expect_err("daemon is down");
    assert!(matches!(err, EngineError::Transport { .. }));
    assert!(daemon.calls_to("aria2.getVersion").len() > 1);
}
