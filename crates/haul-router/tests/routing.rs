use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use haul_core::{
    Backend, EngineError, EngineHandle, EngineSettings, RemoveOptions, SubmitRequest, TaskEngine,
    TaskSource, engine_events,
};
use haul_router::HybridRouter;
use haul_test_support::mocks::RecordingEngine;

struct Fixture {
    router: HybridRouter,
    remote: Arc<RecordingEngine>,
    in_process: Arc<RecordingEngine>,
}

fn fixture(torrent_backend: Backend, http_backend: Backend) -> Fixture {
    let (events, _receiver) = engine_events();
    let remote = Arc::new(RecordingEngine::new(Backend::Remote, events.clone()));
    let in_process = Arc::new(RecordingEngine::new(Backend::InProcess, events));
    let settings = EngineSettings {
        torrent_backend,
        http_backend,
        ..EngineSettings::default()
    };
    let router = HybridRouter::new(remote.clone(), in_process.clone(), &settings);
    Fixture {
        router,
        remote,
        in_process,
    }
}

fn magnet() -> SubmitRequest {
    SubmitRequest::new(TaskSource::Magnet {
        uri: "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".into(),
    })
}

fn direct() -> SubmitRequest {
    SubmitRequest::new(TaskSource::Url {
        url: "https://example.com/file.bin".into(),
    })
}

#[tokio::test]
async fn opposite_preferences_route_to_the_owning_backend() -> Result<()> {
    let f = fixture(Backend::Remote, Backend::InProcess);
    let torrent = f.router.submit(magnet()).await?;
    let http = f.router.submit(direct()).await?;
    assert_eq!(f.router.owner_of(&torrent), Some(Backend::Remote));
    assert_eq!(f.router.owner_of(&http), Some(Backend::InProcess));
    assert_eq!(f.router.route_count(), 2);
    assert_eq!(f.router.backend_of(&http), Backend::InProcess);

    f.router.pause(&torrent).await?;
    f.router.resume(&torrent).await?;
    f.router.pause(&http).await?;
    f.router.cancel(&http).await?;

    assert_eq!(f.remote.submitted.read().await.len(), 1);
    assert_eq!(f.in_process.submitted.read().await.len(), 1);
    assert_eq!(f.remote.task_calls().await, 2);
    assert_eq!(f.in_process.task_calls().await, 2);
    assert_eq!(f.remote.paused.read().await.as_slice(), &[torrent]);
    assert_eq!(f.in_process.cancelled.read().await.as_slice(), &[http]);
    Ok(())
}

#[tokio::test]
async fn default_preferences_send_torrents_in_process() -> Result<()> {
    let f = fixture(Backend::InProcess, Backend::Remote);
    let torrent = f.router.submit(magnet()).await?;
    let http = f.router.submit(direct()).await?;
    assert!(torrent.as_str().starts_with("inproc-"));
    assert!(http.as_str().starts_with("remote-"));
    let status = f.router.status(&http).await?;
    assert_eq!(status.backend, Backend::Remote);
    Ok(())
}

#[tokio::test]
async fn remove_drops_the_routing_entry() -> Result<()> {
    let f = fixture(Backend::InProcess, Backend::Remote);
    let handle = f.router.submit(direct()).await?;
    f.router
        .remove(&handle, RemoveOptions { delete_files: true })
        .await?;
    assert_eq!(f.router.owner_of(&handle), None);
    assert!(matches!(
        f.router.pause(&handle).await,
        Err(EngineError::UnknownHandle { .. })
    ));
    assert_eq!(
        f.remote.removed.read().await.as_slice(),
        &[(handle, RemoveOptions { delete_files: true })]
    );
    assert_eq!(f.in_process.task_calls().await, 0);
    Ok(())
}

#[tokio::test]
async fn unrouted_handles_are_unknown() {
    let f = fixture(Backend::InProcess, Backend::Remote);
    let ghost = EngineHandle::new("ghost");
    assert!(matches!(
        f.router.status(&ghost).await,
        Err(EngineError::UnknownHandle { .. })
    ));
}

#[tokio::test]
async fn submission_failure_creates_no_route() -> Result<()> {
    let f = fixture(Backend::InProcess, Backend::Remote);
    f.remote.fail_submissions("daemon offline").await;
    assert!(f.router.submit(direct()).await.is_err());
    assert_eq!(f.router.route_count(), 0);
    Ok(())
}

#[tokio::test]
async fn list_concatenates_both_backends() -> Result<()> {
    let f = fixture(Backend::InProcess, Backend::Remote);
    f.router.submit(magnet()).await?;
    f.router.submit(direct()).await?;
    f.router.submit(direct()).await?;
    let snapshots = f.router.list().await?;
    assert_eq!(snapshots.len(), 3);
    assert_eq!(
        snapshots
            .iter()
            .filter(|s| s.backend == Backend::Remote)
            .count(),
        2
    );
    Ok(())
}

#[tokio::test]
async fn lifecycle_and_configuration_fan_out() -> Result<()> {
    let f = fixture(Backend::InProcess, Backend::Remote);
    f.router.start().await?;
    let flipped = EngineSettings {
        torrent_backend: Backend::Remote,
        http_backend: Backend::InProcess,
        ..EngineSettings::default()
    };
    f.router.configure(&flipped).await?;
    assert_eq!(f.remote.configured.read().await.len(), 1);
    assert_eq!(f.in_process.configured.read().await.len(), 1);

    let torrent = f.router.submit(magnet()).await?;
    assert_eq!(f.router.owner_of(&torrent), Some(Backend::Remote));

    let version = f.router.version().await?;
    assert!(version.contains("recording-remote"));
    assert!(version.contains("recording-inproc"));

    f.router.stop().await?;
    assert_eq!(f.remote.starts.load(Ordering::SeqCst), 1);
    assert_eq!(f.in_process.stops.load(Ordering::SeqCst), 1);
    assert_eq!(f.router.route_count(), 0);
    Ok(())
}

#[tokio::test]
async fn listed_tasks_are_routable_after_a_restart() -> Result<()> {
    let f = fixture(Backend::InProcess, Backend::Remote);
    let survivor = f.router.submit(direct()).await?;

    let settings = EngineSettings::default();
    let restarted = HybridRouter::new(f.remote.clone(), f.in_process.clone(), &settings);
    assert_eq!(restarted.route_count(), 0);
    let live = restarted.list().await?;
    assert_eq!(live.len(), 1);
    assert_eq!(restarted.owner_of(&survivor), Some(Backend::Remote));

    restarted.pause(&survivor).await?;
    restarted
        .remove(&survivor, RemoveOptions::default())
        .await?;
    assert_eq!(f.remote.paused.read().await.as_slice(), &[survivor.clone()]);
    assert_eq!(f.remote.removed.read().await.len(), 1);
    assert!(f.remote.list().await?.is_empty());
    assert_eq!(f.in_process.task_calls().await, 0);
    Ok(())
}

#[tokio::test]
async fn unlisted_survivors_are_found_through_status() -> Result<()> {
    let f = fixture(Backend::Remote, Backend::InProcess);
    let survivor = f.router.submit(direct()).await?;

    let settings = EngineSettings::default();
    let restarted = HybridRouter::new(f.remote.clone(), f.in_process.clone(), &settings);
    restarted.cancel(&survivor).await?;
    assert_eq!(restarted.owner_of(&survivor), Some(Backend::InProcess));
    assert_eq!(f.in_process.cancelled.read().await.as_slice(), &[survivor]);
    assert_eq!(f.remote.task_calls().await, 0);
    Ok(())
}
