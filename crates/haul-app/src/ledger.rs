//! Serialised access to task records.
//!
//! # Design
//! - Every read-modify-write of a record happens while holding that record's
//!   async mutex, so a caller operation and an engine callback on the same
//!   task cannot interleave.
//! - Handle lookups go through an index refreshed on every save; a stale hit
//!   falls back to the repository.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use haul_core::{RepositoryError, TaskFilter, TaskRecord, TaskRepository};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Default)]
struct HandleIndex {
    by_handle: HashMap<String, Uuid>,
    by_id: HashMap<Uuid, String>,
}

impl HandleIndex {
    fn set(&mut self, id: Uuid, handle: Option<&str>) {
        if let Some(previous) = self.by_id.remove(&id) {
            self.by_handle.remove(&previous);
        }
        if let Some(handle) = handle {
            self.by_handle.insert(handle.to_string(), id);
            self.by_id.insert(id, handle.to_string());
        }
    }
}

/// Single writer over the task repository.
pub struct TaskLedger {
    repository: Arc<dyn TaskRepository>,
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    handles: Mutex<HandleIndex>,
}

/// Exclusive access to one record until dropped.
pub struct RecordGuard<'a> {
    ledger: &'a TaskLedger,
    id: Uuid,
    _held: OwnedMutexGuard<()>,
}

impl RecordGuard<'_> {
    /// Identifier of the locked record.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Read the current record.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when the record is gone.
    pub async fn load(&self) -> AppResult<TaskRecord> {
        self.ledger
            .find(self.id)
            .await?
            .ok_or(AppError::NotFound { id: self.id })
    }

    /// Write `record` back, stamping `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository rejects the update.
    pub async fn save(&self, record: &mut TaskRecord) -> AppResult<()> {
        record.updated_at = Utc::now();
        self.ledger
            .repository
            .update(record)
            .await
            .map_err(|err| not_found_or(record.id, "update", err))?;
        self.ledger
            .index()
            .set(record.id, record.engine_id.as_deref());
        Ok(())
    }

    /// Delete the record.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository rejects the delete.
    pub async fn delete(self) -> AppResult<()> {
        self.ledger
            .repository
            .delete(self.id)
            .await
            .map_err(|err| not_found_or(self.id, "delete", err))?;
        self.ledger.index().set(self.id, None);
        self.ledger.lock_table().remove(&self.id);
        Ok(())
    }
}

impl TaskLedger {
    /// Ledger over `repository`.
    #[must_use]
    pub fn new(repository: Arc<dyn TaskRepository>) -> Self {
        Self {
            repository,
            locks: Mutex::new(HashMap::new()),
            handles: Mutex::new(HandleIndex::default()),
        }
    }

    fn index(&self) -> MutexGuard<'_, HandleIndex> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for exclusive access to record `id`.
    pub async fn lock(&self, id: Uuid) -> RecordGuard<'_> {
        let mutex = Arc::clone(self.lock_table().entry(id).or_default());
        RecordGuard {
            ledger: self,
            id,
            _held: mutex.lock_owned().await,
        }
    }

    /// Insert a new record.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository rejects the insert.
    pub async fn create(&self, record: &TaskRecord) -> AppResult<()> {
        self.repository
            .create(record)
            .await
            .map_err(|err| AppError::repository("create", err))?;
        self.index().set(record.id, record.engine_id.as_deref());
        Ok(())
    }

    /// Record by identifier, if present.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository fails.
    pub async fn find(&self, id: Uuid) -> AppResult<Option<TaskRecord>> {
        self.repository
            .get(id)
            .await
            .map_err(|err| AppError::repository("get", err))
    }

    /// Record by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when absent.
    pub async fn get(&self, id: Uuid) -> AppResult<TaskRecord> {
        self.find(id).await?.ok_or(AppError::NotFound { id })
    }

    /// Records matching `filter`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository fails.
    pub async fn list(&self, filter: &TaskFilter) -> AppResult<Vec<TaskRecord>> {
        self.repository
            .list(filter)
            .await
            .map_err(|err| AppError::repository("list", err))
    }

    /// Record currently holding `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error when the repository fails.
    pub async fn find_by_handle(&self, handle: &str) -> AppResult<Option<TaskRecord>> {
        let cached = self.index().by_handle.get(handle).copied();
        let record = match cached {
            Some(id) => self.find(id).await?,
            None => None,
        };
        let record = match record {
            Some(record) if record.engine_id.as_deref() == Some(handle) => Some(record),
            _ => self
                .repository
                .get_by_handle(handle)
                .await
                .map_err(|err| AppError::repository("get by handle", err))?,
        };
        if let Some(record) = &record {
            self.index().set(record.id, Some(handle));
        }
        Ok(record)
    }

    /// Lock, load, apply `change`, and save. Nothing is written when `change` fails.
    ///
    /// # Errors
    ///
    /// Returns the error from `change`, or a repository failure.
    pub async fn mutate<F>(&self, id: Uuid, change: F) -> AppResult<TaskRecord>
    where
        F: FnOnce(&mut TaskRecord) -> AppResult<()> + Send,
    {
        let guard = self.lock(id).await;
        let mut record = guard.load().await?;
        change(&mut record)?;
        guard.save(&mut record).await?;
        Ok(record)
    }
}

fn not_found_or(id: Uuid, operation: &'static str, err: RepositoryError) -> AppError {
    match err {
        RepositoryError::NotFound { .. } => AppError::NotFound { id },
        other => AppError::repository(operation, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haul_core::TaskStatus;
    use haul_data::MemoryTaskStore;

    fn ledger() -> TaskLedger {
        TaskLedger::new(Arc::new(MemoryTaskStore::new()))
    }

    #[tokio::test]
    async fn failed_change_leaves_record_untouched() -> anyhow::Result<()> {
        let ledger = ledger();
        let record = TaskRecord::new("https://example.com/a", "a");
        ledger.create(&record).await?;

        let result = ledger
            .mutate(record.id, |r| {
                r.filename = "renamed".into();
                r.transition(TaskStatus::Complete)?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(AppError::Transition { .. })));
        assert_eq!(ledger.get(record.id).await?, record);
        Ok(())
    }

    #[tokio::test]
    async fn handle_index_follows_saves() -> anyhow::Result<()> {
        let ledger = ledger();
        let record = TaskRecord::new("https://example.com/b", "b");
        ledger.create(&record).await?;

        ledger
            .mutate(record.id, |r| {
                r.engine_id = Some("gid-1".into());
                Ok(())
            })
            .await?;
        assert_eq!(
            ledger.find_by_handle("gid-1").await?.map(|r| r.id),
            Some(record.id)
        );

        ledger
            .mutate(record.id, |r| {
                r.engine_id = Some("gid-2".into());
                Ok(())
            })
            .await?;
        assert!(ledger.find_by_handle("gid-1").await?.is_none());
        assert!(ledger.find_by_handle("gid-2").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_mutations_serialise() -> anyhow::Result<()> {
        let ledger = Arc::new(ledger());
        let record = TaskRecord::new("https://example.com/c", "c");
        ledger.create(&record).await?;

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let ledger = Arc::clone(&ledger);
            tasks.push(tokio::spawn(async move {
                ledger
                    .mutate(record.id, |r| {
                        r.downloaded_bytes += 1;
                        Ok(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await??;
        }
        assert_eq!(ledger.get(record.id).await?.downloaded_bytes, 20);
        Ok(())
    }

    #[tokio::test]
    async fn deleted_records_are_not_found() -> anyhow::Result<()> {
        let ledger = ledger();
        let record = TaskRecord::new("https://example.com/d", "d");
        ledger.create(&record).await?;
        ledger.lock(record.id).await.delete().await?;
        assert!(matches!(
            ledger.get(record.id).await,
            Err(AppError::NotFound { .. })
        ));
        let result = ledger.mutate(record.id, |_| Ok(())).await;
        assert!(matches!(result, Err(AppError::NotFound { .. })));
        Ok(())
    }
}
