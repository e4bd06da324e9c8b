//! HTTP client for the rclone remote-control (`rc`) API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use haul_core::{
    CloudSync, CloudSyncError, CopyRequest, JobHandle, JobState, JobStatus, TransferConfig,
    TransferProgress, UploadRequest,
};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{ErrorBody, JobCreated, JobStatusBody, StatsBody};

/// Connection settings for the rc endpoint.
#[derive(Debug, Clone)]
pub struct RcloneConfig {
    /// Base URL, e.g. `http://127.0.0.1:5572`.
    pub rc_url: String,
    /// Basic-auth user.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Cadence for polling copy-by-URL jobs.
    pub poll_interval: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for RcloneConfig {
    fn default() -> Self {
        Self {
            rc_url: "http://127.0.0.1:5572".to_string(),
            username: None,
            password: None,
            poll_interval: Duration::from_millis(1_500),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// [`CloudSync`] implementation that drives an rclone rc server.
#[derive(Clone)]
pub struct RcloneClient {
    http: Client,
    config: RcloneConfig,
}

impl RcloneClient {
    /// Build a client.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(config: RcloneConfig) -> Result<Self, CloudSyncError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| CloudSyncError::Request {
                operation: "build client",
                source: Box::new(source),
            })?;
        Ok(Self { http, config })
    }

    async fn post<B, T>(&self, operation: &'static str, method: &str, body: &B) -> Result<T, CloudSyncError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}/{method}", self.config.rc_url.trim_end_matches('/'));
        let mut request = self.http.post(&url).json(body);
        if let Some(user) = &self.config.username {
            request = request.basic_auth(user, self.config.password.as_deref());
        }
        let response = request.send().await.map_err(|source| CloudSyncError::Request {
            operation,
            source: Box::new(source),
        })?;
        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => format!("rc returned status {status}"),
            };
            return Err(CloudSyncError::Remote { operation, message });
        }
        response.json::<T>().await.map_err(|source| CloudSyncError::Request {
            operation,
            source: Box::new(source),
        })
    }

    async fn stats(&self, job: &JobHandle) -> Result<StatsBody, CloudSyncError> {
        self.post("stats", "core/stats", &json!({ "group": format!("job/{}", job.0) }))
            .await
    }

    async fn poll_copy(
        &self,
        job: &JobHandle,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<(), CloudSyncError> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    if let Err(err) = self.cancel_job(job).await {
                        warn!(job = %job, detail = %err.detail(), "failed to stop cancelled copy");
                    }
                    return Err(CloudSyncError::Cancelled);
                }
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
            let status = self.job_status(job).await?;
            progress.record(status.transferred, status.total);
            match status.state {
                JobState::Running => {}
                JobState::Succeeded => return Ok(()),
                JobState::Failed { message } => {
                    return Err(CloudSyncError::Remote {
                        operation: "copyurl",
                        message,
                    });
                }
            }
        }
    }
}

/// `_config` overrides applied to a single rc call.
fn transfer_overrides(transfer: &TransferConfig) -> Map<String, Value> {
    let mut config = Map::new();
    if transfer.streams > 0 {
        config.insert("MultiThreadStreams".into(), Value::from(transfer.streams));
        config.insert("MultiThreadCutoff".into(), Value::from("0"));
    }
    config.insert("LowLevelRetries".into(), Value::from(transfer.retries));
    config.insert("InsecureSkipVerify".into(), Value::from(transfer.insecure_tls));
    if let Some(agent) = &transfer.user_agent {
        config.insert("UserAgent".into(), Value::from(agent.clone()));
    }
    if !transfer.headers.is_empty() {
        let headers: Vec<Value> = transfer
            .headers
            .iter()
            .map(|(key, value)| json!({ "Key": key, "Value": value }))
            .collect();
        config.insert("Headers".into(), Value::Array(headers));
    }
    config
}

fn split_local(path: &Path) -> (String, String) {
    let parent = path
        .parent()
        .map(|dir| dir.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    (parent, name)
}

fn join_remote(destination: &str, leaf: &str) -> String {
    if destination.ends_with(':') || destination.ends_with('/') {
        format!("{destination}{leaf}")
    } else {
        format!("{destination}/{leaf}")
    }
}

#[async_trait]
impl CloudSync for RcloneClient {
    async fn upload_job(&self, request: &UploadRequest) -> Result<JobHandle, CloudSyncError> {
        let is_dir = tokio::fs::metadata(&request.local_path)
            .await
            .map(|meta| meta.is_dir())
            .map_err(|source| CloudSyncError::Request {
                operation: "upload",
                source: Box::new(source),
            })?;
        let (parent, name) = split_local(&request.local_path);
        let (method, body) = if is_dir {
            let method = if request.delete_source { "sync/move" } else { "sync/copy" };
            let body = json!({
                "srcFs": request.local_path.to_string_lossy(),
                "dstFs": join_remote(&request.destination, &name),
                "_async": true,
            });
            (method, body)
        } else {
            let method = if request.delete_source {
                "operations/movefile"
            } else {
                "operations/copyfile"
            };
            let body = json!({
                "srcFs": parent,
                "srcRemote": name,
                "dstFs": request.destination,
                "dstRemote": name,
                "_async": true,
            });
            (method, body)
        };
        let created: JobCreated = self.post("upload", method, &body).await?;
        let job = JobHandle(created.jobid.to_string());
        info!(job = %job, method, local = %request.local_path.display(), destination = %request.destination, "started rclone upload");
        Ok(job)
    }

    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus, CloudSyncError> {
        let id: u64 = job.0.parse().map_err(|_| CloudSyncError::Remote {
            operation: "job status",
            message: format!("invalid job id {job}"),
        })?;
        let body: JobStatusBody = self
            .post("job status", "job/status", &json!({ "jobid": id }))
            .await?;
        let stats = match self.stats(job).await {
            Ok(stats) => stats,
            Err(err) => {
                debug!(job = %job, detail = %err.detail(), "rclone stats unavailable");
                StatsBody::default()
            }
        };
        let state = if !body.finished {
            JobState::Running
        } else if body.success {
            JobState::Succeeded
        } else {
            JobState::Failed {
                message: if body.error.is_empty() {
                    "job failed".to_string()
                } else {
                    body.error
                },
            }
        };
        let total = stats.total_bytes.max(stats.bytes);
        let transferred = if state == JobState::Succeeded && total > 0 {
            total
        } else {
            stats.bytes
        };
        Ok(JobStatus {
            state,
            transferred,
            total,
            speed: stats.speed_bytes(),
        })
    }

    async fn cancel_job(&self, job: &JobHandle) -> Result<(), CloudSyncError> {
        let id: u64 = job.0.parse().map_err(|_| CloudSyncError::Remote {
            operation: "job stop",
            message: format!("invalid job id {job}"),
        })?;
        let _: Value = self.post("job stop", "job/stop", &json!({ "jobid": id })).await?;
        debug!(job = %job, "stopped rclone job");
        Ok(())
    }

    async fn copy_by_url(
        &self,
        request: &CopyRequest,
        progress: &TransferProgress,
        cancel: CancellationToken,
    ) -> Result<PathBuf, CloudSyncError> {
        if cancel.is_cancelled() {
            return Err(CloudSyncError::Cancelled);
        }
        if request.transfer.proxy.is_some() {
            debug!("rclone applies its own proxy environment to copyurl");
        }
        let body = json!({
            "fs": request.destination_dir.to_string_lossy(),
            "remote": request.filename,
            "url": request.source_url,
            "autoFilename": false,
            "_async": true,
            "_config": Value::Object(transfer_overrides(&request.transfer)),
        });
        let created: JobCreated = self.post("copyurl", "operations/copyurl", &body).await?;
        let job = JobHandle(created.jobid.to_string());
        debug!(job = %job, url = %request.source_url, "started rclone copyurl");
        self.poll_copy(&job, progress, &cancel).await?;
        Ok(request.destination_dir.join(&request.filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client_for(server: &MockServer) -> RcloneClient {
        RcloneClient::new(RcloneConfig {
            rc_url: server.base_url(),
            poll_interval: Duration::from_millis(10),
            ..RcloneConfig::default()
        })
        .expect("client")
    }

    #[tokio::test]
    async fn upload_file_uses_copyfile() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("movie.mkv");
        std::fs::write(&file, b"x")?;
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/operations/copyfile");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"jobid": 42}));
        });

        let job = client_for(&server)
            .upload_job(&UploadRequest {
                local_path: file,
                destination: "gdrive:media".into(),
                delete_source: false,
            })
            .await?;
        assert_eq!(job, JobHandle("42".into()));
        mock.assert();
        Ok(())
    }

    #[tokio::test]
    async fn upload_directory_with_move_uses_sync_move() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/sync/move");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"jobid": 7}));
        });
        let job = client_for(&server)
            .upload_job(&UploadRequest {
                local_path: dir.path().to_path_buf(),
                destination: "gdrive:".into(),
                delete_source: true,
            })
            .await?;
        assert_eq!(job.0, "7");
        mock.assert();
        Ok(())
    }

    #[tokio::test]
    async fn job_status_merges_stats() -> anyhow::Result<()> {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/job/status");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"id": 3, "finished": false, "success": false, "error": ""}));
        });
        server.mock(|when, then| {
            when.method(POST).path("/core/stats");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"bytes": 50, "totalBytes": 200, "speed": 12.5}));
        });
        let status = client_for(&server).job_status(&JobHandle("3".into())).await?;
        assert_eq!(status.state, JobState::Running);
        assert_eq!(status.transferred, 50);
        assert_eq!(status.total, 200);
        assert_eq!(status.speed, 12);
        Ok(())
    }

    #[tokio::test]
    async fn failed_job_reports_error_text() -> anyhow::Result<()> {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/job/status");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"finished": true, "success": false, "error": "quota exceeded"}));
        });
        server.mock(|when, then| {
            when.method(POST).path("/core/stats");
            then.status(500)
                .header("content-type", "application/json")
                .json_body(json!({"error": "no such group", "status": 500}));
        });
        let status = client_for(&server).job_status(&JobHandle("9".into())).await?;
        assert_eq!(
            status.state,
            JobState::Failed {
                message: "quota exceeded".into()
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn rc_errors_surface_message() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/job/stop");
            then.status(500)
                .header("content-type", "application/json")
                .json_body(json!({"error": "job not found", "status": 500}));
        });
        let err = client_for(&server)
            .cancel_job(&JobHandle("1".into()))
            .await
            .expect_err("rc error");
        assert_eq!(err.detail(), "job stop: job not found");
    }

    #[tokio::test]
    async fn copy_by_url_polls_until_finished() -> anyhow::Result<()> {
        let server = MockServer::start_async().await;
        let copy = server.mock(|when, then| {
            when.method(POST).path("/operations/copyurl");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"jobid": 5}));
        });
        server.mock(|when, then| {
            when.method(POST).path("/job/status");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"finished": true, "success": true, "error": ""}));
        });
        server.mock(|when, then| {
            when.method(POST).path("/core/stats");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"bytes": 100, "totalBytes": 100, "speed": 0}));
        });

        let progress = TransferProgress::default();
        let request = CopyRequest {
            destination_dir: PathBuf::from("/downloads"),
            filename: "file.iso".into(),
            source_url: "https://example.com/file.iso".into(),
            transfer: TransferConfig {
                streams: 4,
                retries: 3,
                ..TransferConfig::default()
            },
        };
        let path = client_for(&server)
            .copy_by_url(&request, &progress, CancellationToken::new())
            .await?;
        assert_eq!(path, PathBuf::from("/downloads/file.iso"));
        assert_eq!(progress.snapshot(), (100, 100));
        copy.assert();
        Ok(())
    }

    #[tokio::test]
    async fn copy_by_url_observes_cancellation() -> anyhow::Result<()> {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/operations/copyurl");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"jobid": 6}));
        });
        let stop = server.mock(|when, then| {
            when.method(POST).path("/job/stop");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({}));
        });
        let client = RcloneClient::new(RcloneConfig {
            rc_url: server.base_url(),
            poll_interval: Duration::from_secs(30),
            ..RcloneConfig::default()
        })?;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let request = CopyRequest {
            destination_dir: PathBuf::from("/downloads"),
            filename: "f".into(),
            source_url: "https://example.com/f".into(),
            transfer: TransferConfig::default(),
        };
        let err = client
            .copy_by_url(&request, &TransferProgress::default(), cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, CloudSyncError::Cancelled));
        stop.assert();
        Ok(())
    }

    #[test]
    fn overrides_carry_streams_and_headers() {
        let mut transfer = TransferConfig {
            streams: 8,
            retries: 2,
            insecure_tls: true,
            user_agent: Some("haul".into()),
            ..TransferConfig::default()
        };
        transfer.headers.insert("Referer".into(), "https://x".into());
        let config = transfer_overrides(&transfer);
        assert_eq!(config["MultiThreadStreams"], 8);
        assert_eq!(config["LowLevelRetries"], 2);
        assert_eq!(config["InsecureSkipVerify"], true);
        assert_eq!(config["Headers"][0]["Key"], "Referer");
    }

    #[test]
    fn remote_paths_join_cleanly() {
        assert_eq!(join_remote("gdrive:", "a"), "gdrive:a");
        assert_eq!(join_remote("gdrive:media", "a"), "gdrive:media/a");
        assert_eq!(join_remote("gdrive:media/", "a"), "gdrive:media/a");
    }
}
