//! PostgreSQL-backed task repository.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use haul_core::{Backend, RepositoryError, TaskFilter, TaskRecord, TaskRepository, TaskStatus};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DataError, Result};

macro_rules! select_tasks {
    ($tail:literal) => {
        concat!(
            "SELECT id, url, resolved_url, status, filename, total_bytes, downloaded_bytes, \
             speed, eta_seconds, error, destination, headers, engine_id, backend, upload_job, \
             local_path, created_at, started_at, completed_at, updated_at FROM tasks ",
            $tail
        )
    };
}

const SELECT_BY_ID: &str = select_tasks!("WHERE id = $1");
const SELECT_BY_HANDLE: &str = select_tasks!("WHERE engine_id = $1 LIMIT 1");
const SELECT_FILTERED: &str = select_tasks!(
    "WHERE (cardinality($1::text[]) = 0 OR status = ANY($1)) \
     AND ($2::boolean IS NULL OR (engine_id IS NOT NULL) = $2) \
     ORDER BY created_at"
);
const MAX_CONNECTIONS: u32 = 5;
const DELETE_TASK: &str = "DELETE FROM tasks WHERE id = $1";

const INSERT_TASK: &str = r"
    INSERT INTO tasks (
        id, url, resolved_url, status, filename, total_bytes, downloaded_bytes, speed,
        eta_seconds, error, destination, headers, engine_id, backend, upload_job, local_path,
        created_at, started_at, completed_at, updated_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
";

const UPDATE_TASK: &str = r"
    UPDATE tasks SET
        url = $2, resolved_url = $3, status = $4, filename = $5, total_bytes = $6,
        downloaded_bytes = $7, speed = $8, eta_seconds = $9, error = $10, destination = $11,
        headers = $12, engine_id = $13, backend = $14, upload_job = $15, local_path = $16,
        created_at = $17, started_at = $18, completed_at = $19, updated_at = $20
    WHERE id = $1
";

/// Database-backed repository for task records.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    /// Initialise the store, applying pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail or the database is unreachable.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|source| DataError::MigrationFailed { source })?;
        Ok(Self { pool })
    }

    /// Connect to `database_url` and run migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot connect or migrations fail.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(database_url)
            .await
            .map_err(|source| DataError::QueryFailed {
                operation: "connect",
                source,
            })?;
        Self::new(pool).await
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn write(&self, sql: &'static str, record: &TaskRecord, operation: &'static str) -> Result<u64> {
        let result = sqlx::query(sql)
            .bind(record.id)
            .bind(&record.url)
            .bind(&record.resolved_url)
            .bind(record.status.as_str())
            .bind(&record.filename)
            .bind(to_i64(record.total_bytes))
            .bind(to_i64(record.downloaded_bytes))
            .bind(to_i64(record.speed))
            .bind(record.eta_seconds.map(to_i64))
            .bind(record.error.as_deref())
            .bind(record.destination.as_deref())
            .bind(Json(&record.headers))
            .bind(record.engine_id.as_deref())
            .bind(record.backend.map(Backend::as_str))
            .bind(record.upload_job.as_deref())
            .bind(record.local_path.as_deref())
            .bind(record.created_at)
            .bind(record.started_at)
            .bind(record.completed_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|source| DataError::QueryFailed { operation, source })?;
        Ok(result.rows_affected())
    }

    async fn fetch_one(
        &self,
        sql: &'static str,
        key: &str,
        operation: &'static str,
    ) -> Result<Option<TaskRecord>> {
        let row = sqlx::query(sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| DataError::QueryFailed { operation, source })?;
        row.as_ref().map(decode_row).transpose()
    }
}

#[async_trait]
impl TaskRepository for PgTaskStore {
    async fn create(&self, record: &TaskRecord) -> std::result::Result<(), RepositoryError> {
        match self.write(INSERT_TASK, record, "insert task").await {
            Ok(_) => Ok(()),
            Err(DataError::QueryFailed {
                source: sqlx::Error::Database(db),
                ..
            }) if db.is_unique_violation() => Err(RepositoryError::Conflict {
                key: record.id.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, id: Uuid) -> std::result::Result<Option<TaskRecord>, RepositoryError> {
        let row = sqlx::query(SELECT_BY_ID)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| DataError::QueryFailed {
                operation: "select task",
                source,
            })?;
        Ok(row.as_ref().map(decode_row).transpose()?)
    }

    async fn get_by_handle(
        &self,
        handle: &str,
    ) -> std::result::Result<Option<TaskRecord>, RepositoryError> {
        Ok(self
            .fetch_one(SELECT_BY_HANDLE, handle, "select task by handle")
            .await?)
    }

    async fn list(
        &self,
        filter: &TaskFilter,
    ) -> std::result::Result<Vec<TaskRecord>, RepositoryError> {
        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        let rows = sqlx::query(SELECT_FILTERED)
            .bind(statuses)
            .bind(filter.has_handle)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| DataError::QueryFailed {
                operation: "list tasks",
                source,
            })?;
        debug!(count = rows.len(), "loaded task records");
        Ok(rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?)
    }

    async fn update(&self, record: &TaskRecord) -> std::result::Result<(), RepositoryError> {
        let affected = self.write(UPDATE_TASK, record, "update task").await?;
        if affected == 0 {
            return Err(RepositoryError::NotFound {
                key: record.id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> std::result::Result<(), RepositoryError> {
        let result = sqlx::query(DELETE_TASK)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|source| DataError::QueryFailed {
                operation: "delete task",
                source,
            })?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound { key: id.to_string() });
        }
        Ok(())
    }
}

fn decode_row(row: &PgRow) -> Result<TaskRecord> {
    let get_err = |source: sqlx::Error| DataError::QueryFailed {
        operation: "decode task row",
        source,
    };
    let status_label: String = row.try_get("status").map_err(get_err)?;
    let status = status_label
        .parse::<TaskStatus>()
        .map_err(|_| DataError::Malformed {
            column: "status",
            value: status_label.clone(),
        })?;
    let backend = row
        .try_get::<Option<String>, _>("backend")
        .map_err(get_err)?
        .map(|label| {
            label.parse::<Backend>().map_err(|_| DataError::Malformed {
                column: "backend",
                value: label.clone(),
            })
        })
        .transpose()?;
    let Json(headers): Json<BTreeMap<String, String>> = row.try_get("headers").map_err(get_err)?;

    Ok(TaskRecord {
        id: row.try_get("id").map_err(get_err)?,
        url: row.try_get("url").map_err(get_err)?,
        resolved_url: row.try_get("resolved_url").map_err(get_err)?,
        status,
        filename: row.try_get("filename").map_err(get_err)?,
        total_bytes: to_u64(row.try_get("total_bytes").map_err(get_err)?),
        downloaded_bytes: to_u64(row.try_get("downloaded_bytes").map_err(get_err)?),
        speed: to_u64(row.try_get("speed").map_err(get_err)?),
        eta_seconds: row
            .try_get::<Option<i64>, _>("eta_seconds")
            .map_err(get_err)?
            .map(to_u64),
        error: row.try_get("error").map_err(get_err)?,
        destination: row.try_get("destination").map_err(get_err)?,
        headers,
        engine_id: row.try_get("engine_id").map_err(get_err)?,
        backend,
        upload_job: row.try_get("upload_job").map_err(get_err)?,
        local_path: row.try_get("local_path").map_err(get_err)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(get_err)?,
        started_at: row.try_get("started_at").map_err(get_err)?,
        completed_at: row.try_get("completed_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
