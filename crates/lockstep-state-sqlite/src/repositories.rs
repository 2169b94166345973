use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lockstep_core::{
    domain::repository::{CommitRecord, CommitStore, PersistedSnapshot},
    CoreError, InstanceStatus, WorkflowId,
};
use sqlx::{sqlite::SqliteRow, Row};
use tracing::{debug, warn};

use crate::{SqliteConfig, SqliteConnection};

/// SQLite implementation of the CommitStore
///
/// Each commit moves the instance's `workflow_latest` pointer from
/// `sequence - 1` to `sequence` and inserts one row into `workflow_commits`
/// inside the same transaction. Commits of different instances contend only
/// for SQLite's write lock, which they wait for up to the busy timeout.
#[derive(Clone)]
pub struct SqliteCommitStore {
    conn: SqliteConnection,
}

impl SqliteCommitStore {
    /// Create a store over an open connection
    pub fn new(conn: SqliteConnection) -> Self {
        Self { conn }
    }

    /// Connect with `config` and create a store
    pub async fn connect(config: &SqliteConfig) -> Result<Self, CoreError> {
        Ok(Self::new(SqliteConnection::new(config).await?))
    }

    /// The underlying connection
    pub fn connection(&self) -> &SqliteConnection {
        &self.conn
    }
}

fn store_error(context: &str, e: sqlx::Error) -> CoreError {
    CoreError::StateStoreError(format!("{}: {}", context, e))
}

fn to_i64(sequence: u64) -> Result<i64, CoreError> {
    i64::try_from(sequence)
        .map_err(|_| CoreError::StateStoreError(format!("Sequence {} out of range", sequence)))
}

fn record_from_row(row: &SqliteRow) -> Result<CommitRecord, CoreError> {
    let sequence: i64 = row
        .try_get("sequence")
        .map_err(|e| store_error("Error getting sequence", e))?;
    let committed_at: DateTime<Utc> = row
        .try_get("committed_at")
        .map_err(|e| store_error("Error getting commit time", e))?;
    let snapshot: String = row
        .try_get("snapshot")
        .map_err(|e| store_error("Error getting snapshot", e))?;

    let snapshot: PersistedSnapshot = serde_json::from_str(&snapshot).map_err(|e| {
        CoreError::SerializationError(format!("Error deserializing snapshot: {}", e))
    })?;

    Ok(CommitRecord {
        sequence: u64::try_from(sequence).map_err(|_| {
            CoreError::StateStoreError(format!("Negative sequence {} in store", sequence))
        })?,
        committed_at,
        snapshot,
    })
}

#[async_trait]
impl CommitStore for SqliteCommitStore {
    async fn commit(&self, record: &CommitRecord) -> Result<(), CoreError> {
        let workflow_id = &record.workflow_id().0;
        let sequence = to_i64(record.sequence)?;
        let status = record.status().as_str();
        let snapshot = serde_json::to_string(&record.snapshot).map_err(|e| {
            CoreError::SerializationError(format!("Error serializing snapshot: {}", e))
        })?;

        let mut tx = self
            .conn
            .pool()
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin commit", e))?;

        // The first statement writes, so the transaction takes the write lock
        // up front and waits out other writers instead of failing to upgrade
        let moved = if sequence == 1 {
            let insert = "
                INSERT INTO workflow_latest (workflow_id, sequence, status)
                VALUES (?, ?, ?)
                ON CONFLICT (workflow_id) DO NOTHING
            ";
            sqlx::query(insert)
                .bind(workflow_id)
                .bind(sequence)
                .bind(status)
                .execute(&mut *tx)
                .await
        } else {
            let update = "
                UPDATE workflow_latest
                SET sequence = ?, status = ?
                WHERE workflow_id = ? AND sequence = ?
            ";
            sqlx::query(update)
                .bind(sequence)
                .bind(status)
                .bind(workflow_id)
                .bind(sequence - 1)
                .execute(&mut *tx)
                .await
        };
        let moved = moved.map_err(|e| store_error("Failed to move latest commit", e))?;

        if moved.rows_affected() == 0 {
            // Dropping the transaction rolls it back
            warn!(workflow_id = %workflow_id, sequence, "Rejected out-of-order commit");
            return Err(CoreError::ConflictError(format!(
                "Commit sequence {} for {} does not follow the latest commit",
                sequence, workflow_id
            )));
        }

        let insert = "
            INSERT INTO workflow_commits (workflow_id, sequence, status, committed_at, snapshot)
            VALUES (?, ?, ?, ?, ?)
        ";
        sqlx::query(insert)
            .bind(workflow_id)
            .bind(sequence)
            .bind(status)
            .bind(record.committed_at)
            .bind(&snapshot)
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::ConflictError(
                    format!("Commit {} for {} already exists", sequence, workflow_id),
                ),
                other => store_error("Failed to insert commit", other),
            })?;

        tx.commit()
            .await
            .map_err(|e| store_error("Failed to commit transaction", e))?;

        debug!(workflow_id = %workflow_id, sequence, status, "Stored commit");
        Ok(())
    }

    async fn load_latest(&self, workflow_id: &WorkflowId) -> Result<Option<CommitRecord>, CoreError> {
        let query = "
            SELECT c.sequence, c.committed_at, c.snapshot
            FROM workflow_commits c
            JOIN workflow_latest l
              ON c.workflow_id = l.workflow_id AND c.sequence = l.sequence
            WHERE l.workflow_id = ?
        ";

        let row = sqlx::query(query)
            .bind(&workflow_id.0)
            .fetch_optional(self.conn.pool())
            .await
            .map_err(|e| store_error("Failed to load latest commit", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn history(&self, workflow_id: &WorkflowId) -> Result<Vec<CommitRecord>, CoreError> {
        let query = "
            SELECT sequence, committed_at, snapshot
            FROM workflow_commits
            WHERE workflow_id = ?
            ORDER BY sequence
        ";

        let rows = sqlx::query(query)
            .bind(&workflow_id.0)
            .fetch_all(self.conn.pool())
            .await
            .map_err(|e| store_error("Failed to load commit history", e))?;

        rows.iter().map(record_from_row).collect()
    }

    async fn list_active(&self) -> Result<Vec<CommitRecord>, CoreError> {
        let query = "
            SELECT c.sequence, c.committed_at, c.snapshot
            FROM workflow_latest l
            JOIN workflow_commits c
              ON c.workflow_id = l.workflow_id AND c.sequence = l.sequence
            WHERE l.status NOT IN (?, ?)
            ORDER BY l.workflow_id
        ";

        let rows = sqlx::query(query)
            .bind(InstanceStatus::Finished.as_str())
            .bind(InstanceStatus::Failed.as_str())
            .fetch_all(self.conn.pool())
            .await
            .map_err(|e| store_error("Failed to list active instances", e))?;

        rows.iter().map(record_from_row).collect()
    }
}
