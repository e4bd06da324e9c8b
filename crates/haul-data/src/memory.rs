//! In-memory task repository.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use haul_core::{RepositoryError, TaskFilter, TaskRecord, TaskRepository};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Repository that keeps records in a map; used in tests and when no
/// database is configured.
#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    records: Arc<RwLock<HashMap<Uuid, TaskRecord>>>,
}

impl MemoryTaskStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskStore {
    async fn create(&self, record: &TaskRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(RepositoryError::Conflict {
                key: record.id.to_string(),
            });
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, RepositoryError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn get_by_handle(&self, handle: &str) -> Result<Option<TaskRecord>, RepositoryError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|record| record.engine_id.as_deref() == Some(handle))
            .cloned())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, RepositoryError> {
        let mut matches: Vec<TaskRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        matches.sort_by_key(|record| record.created_at);
        Ok(matches)
    }

    async fn update(&self, record: &TaskRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound {
                key: record.id.to_string(),
            }),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        self.records
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound { key: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haul_core::TaskStatus;

    #[tokio::test]
    async fn crud_and_handle_lookup() -> Result<(), RepositoryError> {
        let store = MemoryTaskStore::new();
        let mut record = TaskRecord::new("https://example.com/a", "a");
        store.create(&record).await?;
        assert!(matches!(
            store.create(&record).await,
            Err(RepositoryError::Conflict { .. })
        ));

        record.engine_id = Some("gid-1".into());
        record.status = TaskStatus::Active;
        store.update(&record).await?;

        let by_handle = store.get_by_handle("gid-1").await?;
        assert_eq!(by_handle.map(|r| r.id), Some(record.id));

        let active = store
            .list(&TaskFilter::with_statuses([TaskStatus::Active]))
            .await?;
        assert_eq!(active.len(), 1);

        store.delete(record.id).await?;
        assert!(store.get(record.id).await?.is_none());
        assert!(matches!(
            store.delete(record.id).await,
            Err(RepositoryError::NotFound { .. })
        ));
        Ok(())
    }
}
