//! Durable ports for the only two pieces of state the pipeline persists
//! across restarts: the dead-letter queue and the canary deployment
//! registry. Interface-first, in-memory by default, with a SQLite-backed
//! implementation behind the same trait.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub task_id: String,
    pub original_event_type: String,
    pub failure_chain: Vec<String>,
    pub escalated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryRecord {
    pub deployment_id: String,
    pub stage_history: Vec<u8>,
    pub current_health: String,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn push(&self, record: DlqRecord) -> Result<()>;
    async fn list(&self) -> Result<Vec<DlqRecord>>;
    async fn purge(&self) -> Result<usize>;
    async fn len(&self) -> Result<usize>;
}

#[async_trait]
pub trait CanaryStore: Send + Sync {
    async fn upsert(&self, record: CanaryRecord) -> Result<()>;
    async fn get(&self, deployment_id: &str) -> Result<Option<CanaryRecord>>;
    async fn list(&self) -> Result<Vec<CanaryRecord>>;
    async fn remove(&self, deployment_id: &str) -> Result<()>;
}

/// In-memory default, guarded behind a plain mutex.
pub struct InMemoryDlqStore {
    records: parking_lot::Mutex<Vec<DlqRecord>>,
}

impl InMemoryDlqStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn push(&self, record: DlqRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DlqRecord>> {
        Ok(self.records.lock().clone())
    }

    async fn purge(&self) -> Result<usize> {
        let mut records = self.records.lock();
        let n = records.len();
        records.clear();
        Ok(n)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.lock().len())
    }
}

pub struct InMemoryCanaryStore {
    records: parking_lot::Mutex<std::collections::HashMap<String, CanaryRecord>>,
}

impl InMemoryCanaryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: parking_lot::Mutex::new(std::collections::HashMap::new()),
        })
    }
}

#[async_trait]
impl CanaryStore for InMemoryCanaryStore {
    async fn upsert(&self, record: CanaryRecord) -> Result<()> {
        self.records.lock().insert(record.deployment_id.clone(), record);
        Ok(())
    }

    async fn get(&self, deployment_id: &str) -> Result<Option<CanaryRecord>> {
        Ok(self.records.lock().get(deployment_id).cloned())
    }

    async fn list(&self) -> Result<Vec<CanaryRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    async fn remove(&self, deployment_id: &str) -> Result<()> {
        self.records.lock().remove(deployment_id);
        Ok(())
    }
}

/// SQLite-backed implementation shared by both stores' tables.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Arc<Self>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dlq_records (
                task_id TEXT PRIMARY KEY,
                original_event_type TEXT NOT NULL,
                failure_chain TEXT NOT NULL,
                escalated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS canary_records (
                deployment_id TEXT PRIMARY KEY,
                stage_history BLOB NOT NULL,
                current_health TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Arc::new(Self { pool }))
    }
}

#[async_trait]
impl DlqStore for SqliteStore {
    async fn push(&self, record: DlqRecord) -> Result<()> {
        let failure_chain = serde_json::to_string(&record.failure_chain).map_err(PipelineError::serialization)?;
        sqlx::query(
            "INSERT OR REPLACE INTO dlq_records (task_id, original_event_type, failure_chain, escalated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&record.task_id)
        .bind(&record.original_event_type)
        .bind(&failure_chain)
        .bind(record.escalated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DlqRecord>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT task_id, original_event_type, failure_chain, escalated_at FROM dlq_records",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(task_id, original_event_type, failure_chain, escalated_at)| {
                Ok(DlqRecord {
                    task_id,
                    original_event_type,
                    failure_chain: serde_json::from_str(&failure_chain).map_err(PipelineError::serialization)?,
                    escalated_at: DateTime::parse_from_rfc3339(&escalated_at)
                        .map_err(PipelineError::serialization)?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }

    async fn purge(&self) -> Result<usize> {
        let result = sqlx::query("DELETE FROM dlq_records").execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn len(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dlq_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl CanaryStore for SqliteStore {
    async fn upsert(&self, record: CanaryRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO canary_records (deployment_id, stage_history, current_health, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&record.deployment_id)
        .bind(&record.stage_history)
        .bind(&record.current_health)
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, deployment_id: &str) -> Result<Option<CanaryRecord>> {
        let row: Option<(String, Vec<u8>, String, String)> = sqlx::query_as(
            "SELECT deployment_id, stage_history, current_health, updated_at FROM canary_records WHERE deployment_id = ?",
        )
        .bind(deployment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(deployment_id, stage_history, current_health, updated_at)| {
            Ok(CanaryRecord {
                deployment_id,
                stage_history,
                current_health,
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .map_err(PipelineError::serialization)?
                    .with_timezone(&Utc),
            })
        })
        .transpose()
    }

    async fn list(&self) -> Result<Vec<CanaryRecord>> {
        let rows: Vec<(String, Vec<u8>, String, String)> = sqlx::query_as(
            "SELECT deployment_id, stage_history, current_health, updated_at FROM canary_records",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(deployment_id, stage_history, current_health, updated_at)| {
                Ok(CanaryRecord {
                    deployment_id,
                    stage_history,
                    current_health,
                    updated_at: DateTime::parse_from_rfc3339(&updated_at)
                        .map_err(PipelineError::serialization)?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }

    async fn remove(&self, deployment_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM canary_records WHERE deployment_id = ?")
            .bind(deployment_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(task_id: &str) -> DlqRecord {
        DlqRecord {
            task_id: task_id.to_string(),
            original_event_type: "QA_FAILED".to_string(),
            failure_chain: vec!["timeout".to_string(), "timeout".to_string()],
            escalated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_dlq_push_and_list() {
        let store = InMemoryDlqStore::new();
        store.push(record("t1")).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
        let listed = store.list().await.unwrap();
        assert_eq!(listed[0].task_id, "t1");
    }

    #[tokio::test]
    async fn test_in_memory_dlq_purge() {
        let store = InMemoryDlqStore::new();
        store.push(record("t1")).await.unwrap();
        store.push(record("t2")).await.unwrap();
        let purged = store.purge().await.unwrap();
        assert_eq!(purged, 2);
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_in_memory_canary_upsert_and_get() {
        let store = InMemoryCanaryStore::new();
        store
            .upsert(CanaryRecord {
                deployment_id: "d1".to_string(),
                stage_history: vec![10, 25],
                current_health: "healthy".to_string(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let got = store.get("d1").await.unwrap().unwrap();
        assert_eq!(got.current_health, "healthy");
    }

    #[tokio::test]
    async fn test_sqlite_store_roundtrips_dlq_and_canary() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();

        DlqStore::push(store.as_ref(), record("t1")).await.unwrap();
        let listed = DlqStore::list(store.as_ref()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].failure_chain.len(), 2);

        CanaryStore::upsert(
            store.as_ref(),
            CanaryRecord {
                deployment_id: "d1".to_string(),
                stage_history: vec![10, 25, 50],
                current_health: "degraded".to_string(),
                updated_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        let got = CanaryStore::get(store.as_ref(), "d1").await.unwrap().unwrap();
        assert_eq!(got.current_health, "degraded");
        assert_eq!(got.stage_history, vec![10, 25, 50]);
    }

    /// The DLQ and canary registry are the only state this crate persists
    /// across restarts; confirm a record survives closing and reopening the
    /// same on-disk database rather than just an in-process pool.
    #[tokio::test]
    async fn test_sqlite_store_survives_reconnect_to_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("pipeline.sqlite3");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        {
            let store = SqliteStore::connect(&url).await.unwrap();
            DlqStore::push(store.as_ref(), record("t1")).await.unwrap();
        }

        let reopened = SqliteStore::connect(&url).await.unwrap();
        let listed = DlqStore::list(reopened.as_ref()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_id, "t1");
    }
}
