use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use haul_core::{
    CloudSync, CloudSyncError, CopyRequest, EngineError, EngineEvent, EngineEventKind,
    EngineEventReceiver, EngineHandle, EngineSettings, JobHandle, JobStatus, RemoveOptions,
    SubmitRequest, TaskEngine, TaskSource, TaskStatus, TransferProgress, UploadRequest,
    engine_events,
};
use haul_inproc::{
    DynamicStorage, InProcessConfig, InProcessEngine, StubSession, TorrentFile, TorrentKey,
    TorrentMeta,
};
use haul_test_support::fixtures::eventually;
use haul_test_support::mocks::MockCloudSync;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const HASH: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

struct Harness {
    engine: InProcessEngine,
    session: Arc<StubSession>,
    storage: Arc<DynamicStorage>,
    cloud: Arc<MockCloudSync>,
    events: EngineEventReceiver,
    _state: tempfile::TempDir,
}

fn harness_with(config: InProcessConfig) -> Result<Harness> {
    let state = tempfile::tempdir()?;
    let storage = Arc::new(DynamicStorage::new(state.path(), &config.download_dir));
    let session = Arc::new(StubSession::new(Arc::clone(&storage)));
    let cloud = Arc::new(MockCloudSync::default());
    let (events, receiver) = engine_events();
    let engine = InProcessEngine::new(
        session.clone(),
        cloud.clone(),
        Arc::clone(&storage),
        events,
        config,
    );
    Ok(Harness {
        engine,
        session,
        storage,
        cloud,
        events: receiver,
        _state: state,
    })
}

fn harness() -> Result<Harness> {
    harness_with(InProcessConfig {
        download_dir: PathBuf::from("/downloads"),
        sample_interval: Duration::from_millis(20),
        ..InProcessConfig::default()
    })
}

fn album() -> TorrentMeta {
    TorrentMeta {
        name: "album".into(),
        files: vec![
            TorrentFile {
                path: "album/a.flac".into(),
                length: 40_000,
            },
            TorrentFile {
                path: "album/b.flac".into(),
                length: 20_000,
            },
        ],
    }
}

fn magnet() -> SubmitRequest {
    SubmitRequest::new(TaskSource::Magnet {
        uri: format!("magnet:?xt=urn:btih:{HASH}&dn=album"),
    })
}

fn url(raw: &str) -> SubmitRequest {
    SubmitRequest::new(TaskSource::Url { url: raw.into() })
}

async fn next_terminal(events: &mut EngineEventReceiver) -> Result<EngineEvent> {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("event channel closed"))?;
        if event.is_terminal() {
            return Ok(event);
        }
    }
}

async fn assert_no_terminal(events: &mut EngineEventReceiver) {
    let quiet = timeout(Duration::from_millis(200), async {
        loop {
            match events.recv().await {
                Some(event) if event.is_terminal() => return event,
                Some(_) => {}
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "unexpected terminal event: {quiet:?}");
}

#[tokio::test]
async fn http_download_completes_through_copy_by_url() -> Result<()> {
    let mut h = harness()?;
    h.engine.start().await?;
    let mut request = url("https://example.com/files/disk.iso?token=1");
    request.options.headers.insert("Cookie".into(), "a=b".into());
    let handle = h.engine.submit(request).await?;
    assert!(handle.as_str().starts_with("http-"));

    let event = next_terminal(&mut h.events).await?;
    assert_eq!(event.handle, handle);
    assert_eq!(
        event.kind,
        EngineEventKind::Completed {
            path: PathBuf::from("/downloads/disk.iso")
        }
    );
    let copies = h.cloud.copies.read().await;
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].transfer.streams, 4);
    assert_eq!(copies[0].transfer.headers.get("Cookie").map(String::as_str), Some("a=b"));
    assert!(h.engine.list().await?.is_empty());
    h.engine.stop().await?;
    Ok(())
}

#[tokio::test]
async fn http_copy_failure_reports_error() -> Result<()> {
    let mut h = harness()?;
    h.cloud.fail_copies("404 not found").await;
    let handle = h.engine.submit(url("https://example.com/gone.bin")).await?;
    let event = next_terminal(&mut h.events).await?;
    assert_eq!(event.handle, handle);
    match event.kind {
        EngineEventKind::Failed { message } => assert!(message.contains("404 not found")),
        other => panic!("expected failure, got {other:?}"),
    }
    Ok(())
}

struct PanickingCloud;

#[async_trait]
impl CloudSync for PanickingCloud {
    async fn upload_job(&self, _request: &UploadRequest) -> Result<JobHandle, CloudSyncError> {
        Err(CloudSyncError::Cancelled)
    }

    async fn job_status(&self, _job: &JobHandle) -> Result<JobStatus, CloudSyncError> {
        Err(CloudSyncError::Cancelled)
    }

    async fn cancel_job(&self, _job: &JobHandle) -> Result<(), CloudSyncError> {
        Ok(())
    }

    async fn copy_by_url(
        &self,
        _request: &CopyRequest,
        _progress: &TransferProgress,
        _cancel: CancellationToken,
    ) -> Result<PathBuf, CloudSyncError> {
        panic!("transfer exploded");
    }
}

#[tokio::test]
async fn panicking_transfer_becomes_failure_event() -> Result<()> {
    let state = tempfile::tempdir()?;
    let storage = Arc::new(DynamicStorage::new(state.path(), "/downloads"));
    let session = Arc::new(StubSession::new(Arc::clone(&storage)));
    let (events, mut receiver) = engine_events();
    let engine = InProcessEngine::new(
        session,
        Arc::new(PanickingCloud),
        storage,
        events,
        InProcessConfig::default(),
    );
    let handle = engine.submit(url("https://example.com/a")).await?;
    let event = next_terminal(&mut receiver).await?;
    assert_eq!(event.handle, handle);
    match event.kind {
        EngineEventKind::Failed { message } => assert!(message.contains("transfer exploded")),
        other => panic!("expected failure, got {other:?}"),
    }
    // the engine keeps serving after the panic
    assert!(engine.version().await?.contains("stub"));
    Ok(())
}

#[tokio::test]
async fn magnet_without_metadata_times_out_and_is_removed() -> Result<()> {
    let mut h = harness_with(InProcessConfig {
        download_dir: PathBuf::from("/downloads"),
        metadata_timeout: Duration::from_millis(100),
        sample_interval: Duration::from_millis(20),
        ..InProcessConfig::default()
    })?;
    h.engine.start().await?;
    let handle = h.engine.submit(magnet()).await?;
    assert_eq!(handle.as_str(), HASH);
    assert_eq!(h.engine.status(&handle).await?.status, TaskStatus::Resolving);

    let event = next_terminal(&mut h.events).await?;
    match event.kind {
        EngineEventKind::Failed { message } => {
            assert!(message.contains("metadata not received"), "{message}");
        }
        other => panic!("expected timeout failure, got {other:?}"),
    }
    assert!(h.engine.list().await?.is_empty());
    assert!(matches!(
        h.engine.status(&handle).await,
        Err(EngineError::UnknownHandle { .. })
    ));
    let removed = eventually(Duration::from_secs(1), || {
        let session = Arc::clone(&h.session);
        async move {
            let removed = session.removed();
            (!removed.is_empty()).then_some(removed)
        }
    })
    .await;
    assert_eq!(removed, Some(vec![(TorrentKey(HASH.into()), false)]));
    assert!(!h.storage.is_registered(HASH));
    h.engine.stop().await?;
    Ok(())
}

#[tokio::test]
async fn torrent_activates_selected_files_and_completes() -> Result<()> {
    let mut h = harness()?;
    h.session.set_auto_metadata(Some(album()));
    h.engine.start().await?;
    let mut request = magnet();
    request.options.selected_files = vec![1];
    request.options.directory = Some(PathBuf::from("/music"));
    let handle = h.engine.submit(request).await?;
    let key = TorrentKey(HASH.into());
    assert_eq!(h.session.output_dir(&key), Some(PathBuf::from("/music")));

    let activated = eventually(Duration::from_secs(2), || {
        let session = Arc::clone(&h.session);
        let key = key.clone();
        async move { session.activated_files(&key) }
    })
    .await;
    assert_eq!(activated, Some(vec![1]));
    assert_eq!(h.engine.status(&handle).await?.status, TaskStatus::Active);

    h.session.advance(&key, 8_000);
    let progress = loop {
        let event = timeout(Duration::from_secs(2), h.events.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("event channel closed"))?;
        if let EngineEventKind::Progress(sample) = event.kind {
            if sample.downloaded > 0 {
                break sample;
            }
        }
    };
    assert_eq!(progress.total, 20_000);
    assert_eq!(progress.files.len(), 1);
    assert_eq!(progress.files[0].index, 1);

    h.session.advance(&key, 20_000);
    let event = next_terminal(&mut h.events).await?;
    assert_eq!(event.handle, handle);
    assert_eq!(
        event.kind,
        EngineEventKind::Completed {
            path: PathBuf::from("/music/album")
        }
    );
    assert!(h.engine.list().await?.is_empty());
    let dropped = eventually(Duration::from_secs(1), || {
        let session = Arc::clone(&h.session);
        let key = key.clone();
        async move { (!session.contains(&key)).then_some(()) }
    })
    .await;
    assert!(dropped.is_some());
    h.engine.stop().await?;
    Ok(())
}

#[tokio::test]
async fn completion_fires_once() -> Result<()> {
    let mut h = harness()?;
    h.session.set_auto_metadata(Some(album()));
    h.engine.start().await?;
    let handle = h.engine.submit(magnet()).await?;
    let key = TorrentKey(HASH.into());
    eventually(Duration::from_secs(2), || {
        let session = Arc::clone(&h.session);
        let key = key.clone();
        async move { session.activated_files(&key) }
    })
    .await;
    h.session.advance(&key, 60_000);
    let event = next_terminal(&mut h.events).await?;
    assert_eq!(event.handle, handle);
    assert_no_terminal(&mut h.events).await;
    h.engine.stop().await?;
    Ok(())
}

#[tokio::test]
async fn cancelled_http_task_stays_silent() -> Result<()> {
    let mut h = harness()?;
    h.cloud.set_copy_delay(Duration::from_secs(30)).await;
    let handle = h.engine.submit(url("https://example.com/big.bin")).await?;
    eventually(Duration::from_secs(1), || {
        let cloud = Arc::clone(&h.cloud);
        async move { (!cloud.copies.read().await.is_empty()).then_some(()) }
    })
    .await;
    h.engine.cancel(&handle).await?;
    assert_no_terminal(&mut h.events).await;
    assert!(matches!(
        h.engine.cancel(&handle).await,
        Err(EngineError::UnknownHandle { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn http_pause_stops_transfer_and_resume_restarts_it() -> Result<()> {
    let mut h = harness()?;
    h.cloud.set_copy_delay(Duration::from_millis(300)).await;
    let handle = h.engine.submit(url("https://example.com/movie.mkv")).await?;
    h.engine.pause(&handle).await?;
    assert_eq!(h.engine.status(&handle).await?.status, TaskStatus::Paused);
    assert_no_terminal(&mut h.events).await;

    h.engine.resume(&handle).await?;
    assert_eq!(h.engine.status(&handle).await?.status, TaskStatus::Active);
    let event = next_terminal(&mut h.events).await?;
    assert_eq!(
        event.kind,
        EngineEventKind::Completed {
            path: PathBuf::from("/downloads/movie.mkv")
        }
    );
    assert_eq!(h.cloud.copies.read().await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn torrent_pause_and_resume_delegate_to_session() -> Result<()> {
    let h = harness()?;
    let handle = h.engine.submit(magnet()).await?;
    let key = TorrentKey(HASH.into());
    h.engine.pause(&handle).await?;
    assert!(h.session.is_paused(&key));
    assert_eq!(h.engine.status(&handle).await?.status, TaskStatus::Paused);
    h.engine.resume(&handle).await?;
    assert!(!h.session.is_paused(&key));
    assert_eq!(h.engine.status(&handle).await?.status, TaskStatus::Resolving);
    h.engine
        .remove(&handle, RemoveOptions { delete_files: true })
        .await?;
    assert_eq!(h.session.removed(), vec![(key, true)]);
    Ok(())
}

#[tokio::test]
async fn rejected_add_surfaces_and_releases_storage() -> Result<()> {
    let h = harness()?;
    h.session.fail_adds("session offline");
    let err = h.engine.submit(magnet()).await.expect_err("rejected");
    assert!(matches!(err, EngineError::Rejected { .. }));
    assert!(err.detail().contains("session offline"));
    assert!(!h.storage.is_registered(HASH));
    assert!(h.engine.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_handles_are_reported() -> Result<()> {
    let h = harness()?;
    let ghost = EngineHandle::new("ghost");
    assert!(matches!(
        h.engine.pause(&ghost).await,
        Err(EngineError::UnknownHandle { .. })
    ));
    assert!(matches!(
        h.engine.remove(&ghost, RemoveOptions::default()).await,
        Err(EngineError::UnknownHandle { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn configure_updates_defaults_and_session_limits() -> Result<()> {
    let h = harness()?;
    let settings = EngineSettings {
        download_dir: PathBuf::from("/srv/incoming"),
        download_limit: 1_000_000,
        http_streams: 8,
        ..EngineSettings::default()
    };
    h.engine.configure(&settings).await?;
    assert_eq!(h.session.download_limit(), 1_000_000);
    assert_eq!(h.storage.dir_for("unregistered"), PathBuf::from("/srv/incoming"));

    h.cloud.set_copy_delay(Duration::from_secs(30)).await;
    let handle = h.engine.submit(url("https://example.com/x.zip")).await?;
    let snapshot = h.engine.status(&handle).await?;
    assert_eq!(snapshot.path.as_deref(), Some("/srv/incoming/x.zip"));
    eventually(Duration::from_secs(1), || {
        let cloud = Arc::clone(&h.cloud);
        async move { (!cloud.copies.read().await.is_empty()).then_some(()) }
    })
    .await;
    assert_eq!(h.cloud.copies.read().await[0].transfer.streams, 8);
    h.engine.cancel(&handle).await?;
    Ok(())
}

#[tokio::test]
async fn stop_drops_tracked_tasks() -> Result<()> {
    let h = harness()?;
    h.engine.start().await?;
    h.engine.submit(magnet()).await?;
    assert_eq!(h.engine.list().await?.len(), 1);
    h.engine.stop().await?;
    assert!(h.engine.list().await?.is_empty());
    assert!(!h.session.contains(&TorrentKey(HASH.into())));
    Ok(())
}
