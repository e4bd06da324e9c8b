//! Service wiring for the `haul` binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use haul_aria2::{Aria2Engine, WsRpc};
use haul_config::{ConfigService, LogFormatSetting, Settings, SettingsStream, process_env};
use haul_core::{CloudSync, EngineSettings, TaskEngine, TaskRepository, engine_events};
use haul_data::{MemoryTaskStore, PgTaskStore};
use haul_events::{Event, EventBus};
#[cfg(feature = "rqbit")]
use haul_inproc::RqbitSession;
#[cfg(not(feature = "rqbit"))]
use haul_inproc::StubSession;
use haul_inproc::{DynamicStorage, InProcessEngine, TorrentSession};
use haul_rclone::RcloneClient;
use haul_router::HybridRouter;
use haul_telemetry::{LogFormat, LoggingConfig, Metrics};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::download::DownloadService;
use crate::error::{AppError, AppResult};
use crate::ledger::TaskLedger;
use crate::publish::Publisher;
use crate::resolver::DirectResolver;
use crate::upload::UploadService;
use crate::wiring;

const CONFIG_ENV: &str = "HAUL_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "haul.json";
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(5);
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Entry point for the haul boot sequence. Runs until interrupted.
///
/// # Errors
///
/// Returns an error when configuration, logging, the task store, or either
/// engine fails to come up.
pub async fn run_app() -> AppResult<()> {
    let path = std::env::var(CONFIG_ENV)
        .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = ConfigService::new(Some(path), process_env()).map_err(|source| {
        AppError::Config {
            operation: "config.load",
            source,
        }
    })?;
    let settings = config.snapshot();

    haul_telemetry::init_logging(&LoggingConfig {
        level: &settings.telemetry.level,
        format: log_format(settings.telemetry.format),
        build_sha: option_env!("HAUL_BUILD_SHA").unwrap_or("dev"),
    })
    .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    info!(version = env!("CARGO_PKG_VERSION"), "haul starting");

    let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
    let publisher = Publisher::new(EventBus::new(), metrics);
    let repository = open_repository(&settings).await?;
    let (events, engine_receiver) = engine_events();

    let cloud: Arc<dyn CloudSync> = Arc::new(
        RcloneClient::new(wiring::rclone_config(&settings))
            .map_err(|err| AppError::cloud("rclone.new", err))?,
    );
    let rpc = Arc::new(WsRpc::new(
        settings.aria2.rpc_url.clone(),
        settings.aria2.secret.clone(),
        Duration::from_secs(settings.aria2.rpc_timeout_secs),
    ));
    let remote: Arc<dyn TaskEngine> = Arc::new(Aria2Engine::new(
        rpc,
        events.clone(),
        wiring::aria2_config(&settings),
    ));
    let storage = Arc::new(DynamicStorage::new(
        settings.inproc.state_dir.clone(),
        settings.inproc.download_dir.clone(),
    ));
    let session = torrent_session(&settings, &storage).await?;
    let in_process: Arc<dyn TaskEngine> = Arc::new(InProcessEngine::new(
        session,
        Arc::clone(&cloud),
        storage,
        events,
        wiring::inproc_config(&settings),
    ));

    let engine_settings = effective_engine_settings(&settings);
    let router = Arc::new(HybridRouter::new(remote, in_process, &engine_settings));
    router
        .start()
        .await
        .map_err(|err| AppError::engine("router.start", err))?;
    if let Err(err) = router.configure(&engine_settings).await {
        warn!(detail = %err.detail(), "initial engine configuration rejected");
    }

    let ledger = Arc::new(TaskLedger::new(repository));
    let resolver = Arc::new(DirectResolver::new(RESOLVE_TIMEOUT).map_err(|source| {
        AppError::HttpClient {
            operation: "resolver.new",
            source,
        }
    })?);
    let engine: Arc<dyn TaskEngine> = router.clone();
    let downloads = Arc::new(DownloadService::new(
        Arc::clone(&ledger),
        engine,
        resolver,
        publisher.clone(),
    ));
    let uploads = Arc::new(UploadService::new(
        ledger,
        cloud,
        publisher.clone(),
        wiring::upload_config(&settings),
    ));
    let pump = downloads.spawn_event_pump(engine_receiver);
    let upload_listener = uploads.start();

    recover(&downloads, &uploads).await;

    let watcher = config.watch_file(CONFIG_POLL_INTERVAL);
    let reconfigure = spawn_reconfigure(config.subscribe(), Arc::clone(&router), publisher);
    info!("haul ready");

    tokio::signal::ctrl_c()
        .await
        .map_err(|source| AppError::Io {
            operation: "signal.ctrl_c",
            source,
        })?;
    info!("shutdown requested");

    for task in [watcher, reconfigure, upload_listener, pump] {
        task.abort();
    }
    if let Err(err) = router.stop().await {
        warn!(detail = %err.detail(), "engine shutdown failed");
    }
    info!("haul stopped");
    Ok(())
}

async fn recover(downloads: &DownloadService, uploads: &Arc<UploadService>) {
    match downloads.sync().await {
        Ok(reset) => info!(reset, "reconciled task records with engines"),
        Err(err) => warn!(detail = %err.detail(), "startup reconciliation failed"),
    }
    match downloads.requeue_waiting().await {
        Ok(launched) => info!(launched, "waiting tasks resubmitted"),
        Err(err) => warn!(detail = %err.detail(), "requeue of waiting tasks failed"),
    }
    match uploads.resume_pending().await {
        Ok(resumed) => info!(resumed, "pending uploads resumed"),
        Err(err) => warn!(detail = %err.detail(), "resuming uploads failed"),
    }
}

fn spawn_reconfigure(
    mut changes: SettingsStream,
    router: Arc<HybridRouter>,
    publisher: Publisher,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(change) = changes.next().await {
            for warning in &change.warnings {
                warn!(warning = %warning, "settings guard rail applied");
            }
            let engine = effective_engine_settings(&change.settings);
            match router.configure(&engine).await {
                Ok(()) => {
                    publisher.publish(Event::SettingsChanged {
                        description: format!("revision {} applied", change.revision),
                    });
                    info!(revision = change.revision, "engine settings applied");
                }
                Err(err) => {
                    publisher.metrics().inc_config_reload_failure();
                    warn!(
                        revision = change.revision,
                        detail = %err.detail(),
                        "engine settings rejected"
                    );
                }
            }
        }
    })
}

async fn open_repository(settings: &Settings) -> AppResult<Arc<dyn TaskRepository>> {
    if let Some(url) = settings.storage.database_url.as_deref() {
        let store = PgTaskStore::connect(url)
            .await
            .map_err(|source| AppError::Store {
                operation: "postgres.connect",
                source,
            })?;
        info!("task records stored in postgres");
        return Ok(Arc::new(store));
    }
    warn!("no database configured; task records are kept in memory");
    Ok(Arc::new(MemoryTaskStore::new()))
}

const fn log_format(setting: Option<LogFormatSetting>) -> LogFormat {
    match setting {
        Some(LogFormatSetting::Json) => LogFormat::Json,
        Some(LogFormatSetting::Pretty) => LogFormat::Pretty,
        None => LogFormat::infer(),
    }
}

#[cfg(feature = "rqbit")]
async fn torrent_session(
    settings: &Settings,
    storage: &Arc<DynamicStorage>,
) -> AppResult<Arc<dyn TorrentSession>> {
    let session = RqbitSession::new(
        settings.inproc.download_dir.clone(),
        Arc::clone(storage),
        settings.inproc.download_limit,
    )
    .await
    .map_err(|err| AppError::Session { source: err.into() })?;
    Ok(Arc::new(session))
}

#[cfg(not(feature = "rqbit"))]
#[allow(clippy::unused_async)]
async fn torrent_session(
    _settings: &Settings,
    storage: &Arc<DynamicStorage>,
) -> AppResult<Arc<dyn TorrentSession>> {
    Ok(Arc::new(StubSession::new(Arc::clone(storage))))
}

fn effective_engine_settings(settings: &Settings) -> EngineSettings {
    let engine = wiring::engine_settings(settings);
    #[cfg(not(feature = "rqbit"))]
    let engine = without_embedded_torrents(engine);
    engine
}

#[cfg(not(feature = "rqbit"))]
fn without_embedded_torrents(mut engine: EngineSettings) -> EngineSettings {
    if engine.torrent_backend == haul_core::Backend::InProcess {
        warn!("built without the embedded torrent session; torrents go to the remote daemon");
        engine.torrent_backend = haul_core::Backend::Remote;
    }
    engine
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_follows_settings() {
        assert_eq!(log_format(Some(LogFormatSetting::Json)), LogFormat::Json);
        assert_eq!(log_format(Some(LogFormatSetting::Pretty)), LogFormat::Pretty);
        assert_eq!(log_format(None), LogFormat::infer());
    }

    #[cfg(not(feature = "rqbit"))]
    #[test]
    fn stub_builds_send_torrents_to_the_daemon() {
        let engine = effective_engine_settings(&Settings::default());
        assert_eq!(engine.torrent_backend, haul_core::Backend::Remote);
        assert_eq!(engine.http_backend, haul_core::Backend::Remote);
    }

    #[cfg(feature = "rqbit")]
    #[test]
    fn default_builds_keep_torrents_in_process() {
        let engine = effective_engine_settings(&Settings::default());
        assert_eq!(engine.torrent_backend, haul_core::Backend::InProcess);
    }

    #[tokio::test]
    async fn memory_store_is_used_without_a_database() -> anyhow::Result<()> {
        let repository = open_repository(&Settings::default()).await?;
        let filter = haul_core::TaskFilter::default();
        assert!(repository.list(&filter).await?.is_empty());
        Ok(())
    }
}
