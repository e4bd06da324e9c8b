//! Hands completed downloads to cloud sync and follows the job to the end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use haul_core::{CloudSync, JobHandle, JobState, TaskFilter, TaskRecord, TaskStatus, UploadRequest};
use haul_events::Event;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ledger::{RecordGuard, TaskLedger};
use crate::publish::Publisher;

const MAX_POLL_ERRORS: u32 = 5;

/// Upload tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Delay between job status polls.
    pub poll_interval: Duration,
    /// Move instead of copy.
    pub delete_source: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            delete_source: false,
        }
    }
}

/// Owns task records through their upload phase.
pub struct UploadService {
    ledger: Arc<TaskLedger>,
    cloud: Arc<dyn CloudSync>,
    publisher: Publisher,
    config: UploadConfig,
}

impl UploadService {
    /// Service writing through `ledger` and uploading via `cloud`.
    #[must_use]
    pub fn new(
        ledger: Arc<TaskLedger>,
        cloud: Arc<dyn CloudSync>,
        publisher: Publisher,
        config: UploadConfig,
    ) -> Self {
        Self {
            ledger,
            cloud,
            publisher,
            config,
        }
    }

    /// Listen for completed downloads and start their uploads.
    ///
    /// Each handoff runs on its own task so the listener keeps draining the
    /// bus. When the listener lags, completed records still waiting for an
    /// upload are swept from the ledger.
    #[must_use]
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut stream = self.publisher.bus().subscribe(None);
        tokio::spawn(async move {
            while let Some(envelope) = stream.next().await {
                let skipped = stream.take_lagged();
                if skipped > 0 {
                    service.spawn_sweep(skipped);
                }
                if let Event::TaskCompleted { task_id, .. } = envelope.event {
                    service.spawn_hand_off(task_id);
                }
            }
            debug!("event bus closed; upload listener stopping");
        })
    }

    fn spawn_hand_off(self: &Arc<Self>, id: Uuid) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = service.hand_off(id).await {
                warn!(task_id = %id, detail = %err.detail(), "upload handoff failed");
            }
        });
    }

    fn spawn_sweep(self: &Arc<Self>, skipped: u64) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            match service.sweep_completed().await {
                Ok(started) => info!(skipped, started, "swept completed tasks after lag"),
                Err(err) => warn!(detail = %err.detail(), "completed task sweep failed"),
            }
        });
    }

    /// Hand off every completed task that wants an upload and has no job.
    /// Returns how many uploads were started.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository fails.
    pub async fn sweep_completed(self: &Arc<Self>) -> AppResult<usize> {
        let filter = TaskFilter::with_statuses([TaskStatus::Complete]);
        let mut started = 0;
        for record in self.ledger.list(&filter).await? {
            if record.wants_upload() && record.upload_job.is_none() && self.hand_off(record.id).await? {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Start the upload for a completed task that has a destination. Returns
    /// whether a job was started.
    ///
    /// # Errors
    ///
    /// Returns an error when the record cannot be read or written.
    pub async fn hand_off(self: &Arc<Self>, id: Uuid) -> AppResult<bool> {
        let guard = self.ledger.lock(id).await;
        let record = match guard.load().await {
            Ok(record) => record,
            Err(AppError::NotFound { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };
        if !record.wants_upload()
            || record.status != TaskStatus::Complete
            || record.upload_job.is_some()
        {
            return Ok(false);
        }
        self.submit(guard, record).await
    }

    /// Re-attach pollers to running jobs and start uploads that never got a
    /// job. Returns how many uploads were picked up.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository fails.
    pub async fn resume_pending(self: &Arc<Self>) -> AppResult<usize> {
        let filter = TaskFilter::with_statuses([TaskStatus::Uploading, TaskStatus::Complete]);
        let mut resumed = 0;
        for pending in self.ledger.list(&filter).await? {
            if !pending.wants_upload() {
                continue;
            }
            match (pending.status, pending.upload_job.as_deref()) {
                (TaskStatus::Uploading, Some(job)) => {
                    info!(task_id = %pending.id, job_id = job, "re-attaching upload poller");
                    self.spawn_poller(pending.id, JobHandle(job.to_string()));
                    resumed += 1;
                }
                (TaskStatus::Uploading | TaskStatus::Complete, None) => {
                    let guard = self.ledger.lock(pending.id).await;
                    let record = guard.load().await?;
                    if record.status != pending.status || record.upload_job.is_some() {
                        continue;
                    }
                    if self.submit(guard, record).await? {
                        resumed += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(resumed)
    }

    async fn submit(self: &Arc<Self>, guard: RecordGuard<'_>, mut record: TaskRecord) -> AppResult<bool> {
        let id = record.id;
        let from = record.status;
        let destination = record.destination.clone().unwrap_or_default();
        record.transition(TaskStatus::Uploading)?;
        let Some(local_path) = record.local_path.clone() else {
            self.fail(guard, record, None, "upload failed: no local payload".into())
                .await?;
            return Ok(false);
        };

        let request = UploadRequest {
            local_path: PathBuf::from(local_path),
            destination: destination.clone(),
            delete_source: self.config.delete_source,
        };
        match self.cloud.upload_job(&request).await {
            Ok(job) => {
                record.upload_job = Some(job.0.clone());
                guard.save(&mut record).await?;
                drop(guard);

                if from != TaskStatus::Uploading {
                    self.publisher.publish(Event::TaskStatusChanged {
                        task_id: id,
                        from,
                        to: TaskStatus::Uploading,
                    });
                }
                self.publisher.publish(Event::UploadStarted {
                    task_id: id,
                    job_id: job.0.clone(),
                    destination: destination.clone(),
                });
                info!(task_id = %id, job_id = %job, destination = %destination, "upload started");
                self.spawn_poller(id, job);
                Ok(true)
            }
            Err(err) => {
                let message = format!("upload failed: {}", err.detail());
                self.fail(guard, record, None, message).await?;
                Ok(false)
            }
        }
    }

    fn spawn_poller(self: &Arc<Self>, id: Uuid, job: JobHandle) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = service.poll(id, &job).await {
                warn!(task_id = %id, job_id = %job, detail = %err.detail(), "upload poller stopped");
            }
        });
    }

    async fn poll(&self, id: Uuid, job: &JobHandle) -> AppResult<()> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut errors = 0_u32;
        loop {
            ticker.tick().await;
            let Some(record) = self.ledger.find(id).await? else {
                info!(task_id = %id, job_id = %job, "task deleted during upload; cancelling job");
                if let Err(err) = self.cloud.cancel_job(job).await {
                    warn!(job_id = %job, detail = %err.detail(), "failed to cancel orphaned upload");
                }
                return Ok(());
            };
            if record.status != TaskStatus::Uploading
                || record.upload_job.as_deref() != Some(job.0.as_str())
            {
                debug!(task_id = %id, job_id = %job, "upload no longer tracked");
                return Ok(());
            }

            match self.cloud.job_status(job).await {
                Ok(status) => {
                    errors = 0;
                    match status.state {
                        JobState::Running => self.publisher.publish(Event::UploadProgress {
                            task_id: id,
                            job_id: job.0.clone(),
                            transferred: status.transferred,
                            total: status.total,
                            speed: status.speed,
                        }),
                        JobState::Succeeded => return self.finish(id, job, None).await,
                        JobState::Failed { message } => {
                            return self.finish(id, job, Some(message)).await;
                        }
                    }
                }
                Err(err) => {
                    errors += 1;
                    warn!(task_id = %id, job_id = %job, attempt = errors, detail = %err.detail(), "upload status poll failed");
                    if errors >= MAX_POLL_ERRORS {
                        return self.finish(id, job, Some(err.detail())).await;
                    }
                }
            }
        }
    }

    async fn finish(&self, id: Uuid, job: &JobHandle, failure: Option<String>) -> AppResult<()> {
        let guard = self.ledger.lock(id).await;
        let mut record = match guard.load().await {
            Ok(record) => record,
            Err(AppError::NotFound { .. }) => return Ok(()),
            Err(err) => return Err(err),
        };
        if record.status != TaskStatus::Uploading
            || record.upload_job.as_deref() != Some(job.0.as_str())
        {
            return Ok(());
        }

        if let Some(message) = failure {
            self.publisher.metrics().inc_upload("failed");
            return self
                .fail(guard, record, Some(job), format!("upload failed: {message}"))
                .await;
        }

        record.transition(TaskStatus::Complete)?;
        record.clear_handle();
        guard.save(&mut record).await?;
        drop(guard);

        self.publisher.metrics().inc_upload("success");
        self.publisher.publish(Event::UploadCompleted {
            task_id: id,
            job_id: job.0.clone(),
            status: TaskStatus::Complete,
        });
        info!(task_id = %id, job_id = %job, "upload complete");
        Ok(())
    }

    async fn fail(
        &self,
        guard: RecordGuard<'_>,
        mut record: TaskRecord,
        job: Option<&JobHandle>,
        message: String,
    ) -> AppResult<()> {
        let id = record.id;
        record.transition(TaskStatus::Error)?;
        record.error = Some(message.clone());
        record.clear_handle();
        guard.save(&mut record).await?;
        drop(guard);

        self.publisher.metrics().inc_failure("upload");
        self.publisher.publish(Event::UploadFailed {
            task_id: id,
            job_id: job.map(|job| job.0.clone()),
            message: message.clone(),
        });
        warn!(task_id = %id, error = %message, "upload failed");
        Ok(())
    }
}
