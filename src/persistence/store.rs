//! SQLite-based checkpoint store

use crate::core::state::ExecutionStatus;
use crate::persistence::{CheckpointStore, ExecutionSnapshot, ExecutionSummary, PersistError};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// SQLite checkpoint store
///
/// One row per execution: summary columns for history listings plus the full
/// snapshot as JSON.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Create a new SQLite store
    pub async fn new(db_path: &str) -> Result<Self, PersistError> {
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", db_path))
            .await
            .map_err(|e| PersistError::Backend(format!("failed to connect to database: {}", e)))?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self, PersistError> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("flowline");
        std::fs::create_dir_all(&db_dir)?;

        let db_path = db_dir.join("checkpoints.db");
        Self::new(db_path.to_str().expect("valid utf-8 path")).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY,
                script_name TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                node_count INTEGER NOT NULL DEFAULT 0,
                snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_script_name ON checkpoints(script_name);
            CREATE INDEX IF NOT EXISTS idx_status ON checkpoints(status);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PersistError::Backend(e.to_string()))?;

        Ok(())
    }

    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn status_from_str(status: &str) -> ExecutionStatus {
        match status {
            "New" => ExecutionStatus::New,
            "Running" => ExecutionStatus::Running,
            "Paused" => ExecutionStatus::Paused,
            "Complete" => ExecutionStatus::Complete,
            "Aborted" => ExecutionStatus::Aborted,
            _ => ExecutionStatus::New,
        }
    }
}

#[async_trait::async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, snapshot: &ExecutionSnapshot) -> Result<(), PersistError> {
        let body = serde_json::to_string(snapshot)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO checkpoints
            (id, script_name, status, updated_at, node_count, snapshot)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(snapshot.execution_id.to_string())
        .bind(&snapshot.script.name)
        .bind(snapshot.status.to_string())
        .bind(Self::to_naive(snapshot.saved_at))
        .bind(snapshot.nodes.len() as i64)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistError::Backend(format!("failed to save checkpoint: {}", e)))?;

        Ok(())
    }

    async fn load(&self, execution_id: Uuid) -> Result<Option<ExecutionSnapshot>, PersistError> {
        let row = sqlx::query("SELECT snapshot FROM checkpoints WHERE id = ?1")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PersistError::Backend(format!("failed to load checkpoint: {}", e)))?;

        match row {
            Some(row) => {
                let body: String = row.get("snapshot");
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, execution_id: Uuid) -> Result<(), PersistError> {
        sqlx::query("DELETE FROM checkpoints WHERE id = ?1")
            .bind(execution_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| PersistError::Backend(format!("failed to delete checkpoint: {}", e)))?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<ExecutionSummary>, PersistError> {
        let rows = sqlx::query(
            r#"
            SELECT id, script_name, status, updated_at, node_count
            FROM checkpoints
            ORDER BY updated_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PersistError::Backend(format!("failed to list checkpoints: {}", e)))?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                Ok(ExecutionSummary {
                    execution_id: Uuid::parse_str(&id)
                        .map_err(|e| PersistError::Backend(format!("bad execution id: {}", e)))?,
                    script_name: row.get("script_name"),
                    status: Self::status_from_str(&row.get::<String, _>("status")),
                    updated_at: Self::from_naive(row.get("updated_at")),
                    node_count: row.get::<i64, _>("node_count") as usize,
                })
            })
            .collect()
    }
}
