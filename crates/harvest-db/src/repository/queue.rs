//! # Offline Queue Repository
//!
//! Durable storage for [`QueueRecord`]s, keyed by `record_id` and queried by
//! agent and status.
//!
//! ## Row Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  enqueue          INSERT  (status = pending, attempts = 0)             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  each delivery    UPDATE  status, attempts, timestamps, error,         │
//! │                           assigned subject / assignment ids            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  purge            DELETE  by status (synced / failed) or all           │
//! │                                                                         │
//! │  payload, checksum, record_type and collected_at are written once.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use harvest_core::{Payload, Priority, QueueRecord, QueueStats, RecordStatus, RecordType};

const SELECT_COLUMNS: &str = r#"
    record_id, agent_id, device_id, subject_id, subject_ref, assignment_id,
    record_type, payload, metadata, checksum, status, attempts, priority,
    collected_at, last_attempt_at, synced_at, error_message
"#;

/// Raw `offline_queue` row.
#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    record_id: String,
    agent_id: String,
    device_id: String,
    subject_id: Option<i64>,
    subject_ref: Option<String>,
    assignment_id: Option<i64>,
    record_type: String,
    payload: String,
    metadata: String,
    checksum: String,
    status: RecordStatus,
    attempts: i64,
    priority: Priority,
    collected_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    synced_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl TryFrom<QueueRow> for QueueRecord {
    type Error = DbError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        let payload: Payload = serde_json::from_str(&row.payload)?;
        let metadata: Payload = serde_json::from_str(&row.metadata)?;

        Ok(QueueRecord {
            record_id: row.record_id,
            agent_id: row.agent_id,
            device_id: row.device_id,
            subject_id: row.subject_id,
            subject_ref: row.subject_ref,
            assignment_id: row.assignment_id,
            record_type: RecordType::parse(&row.record_type),
            payload,
            metadata,
            checksum: row.checksum,
            status: row.status,
            attempts: row.attempts,
            priority: row.priority,
            collected_at: row.collected_at,
            last_attempt_at: row.last_attempt_at,
            synced_at: row.synced_at,
            error_message: row.error_message,
        })
    }
}

/// Aggregate row for [`QueueRepository::stats`].
#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    record_type: String,
    status: RecordStatus,
    count: i64,
}

/// Repository for offline queue operations.
#[derive(Debug, Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    /// Creates a new QueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        QueueRepository { pool }
    }

    /// Persists a freshly enqueued record.
    ///
    /// Fails with `UniqueViolation` if the `record_id` already exists.
    pub async fn insert(&self, record: &QueueRecord) -> DbResult<()> {
        debug!(
            record_id = %record.record_id,
            record_type = %record.record_type,
            priority = %record.priority,
            "Inserting queue record"
        );

        let payload = serde_json::to_string(&record.payload)?;
        let metadata = serde_json::to_string(&record.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO offline_queue (
                record_id, agent_id, device_id, subject_id, subject_ref, assignment_id,
                record_type, payload, metadata, checksum, status, attempts, priority,
                collected_at, last_attempt_at, synced_at, error_message
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                ?14, ?15, ?16, ?17
            )
            "#,
        )
        .bind(&record.record_id)
        .bind(&record.agent_id)
        .bind(&record.device_id)
        .bind(record.subject_id)
        .bind(&record.subject_ref)
        .bind(record.assignment_id)
        .bind(record.record_type.as_str())
        .bind(payload)
        .bind(metadata)
        .bind(&record.checksum)
        .bind(record.status)
        .bind(record.attempts)
        .bind(record.priority)
        .bind(record.collected_at)
        .bind(record.last_attempt_at)
        .bind(record.synced_at)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => {
                DbError::duplicate(field, record.record_id.clone())
            }
            other => other,
        })?;

        Ok(())
    }

    /// Writes back the mutable delivery fields of a record.
    pub async fn save(&self, record: &QueueRecord) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE offline_queue SET
                subject_id = ?2,
                assignment_id = ?3,
                status = ?4,
                attempts = ?5,
                last_attempt_at = ?6,
                synced_at = ?7,
                error_message = ?8
            WHERE record_id = ?1
            "#,
        )
        .bind(&record.record_id)
        .bind(record.subject_id)
        .bind(record.assignment_id)
        .bind(record.status)
        .bind(record.attempts)
        .bind(record.last_attempt_at)
        .bind(record.synced_at)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("QueueRecord", &record.record_id));
        }

        Ok(())
    }

    /// Loads one record.
    pub async fn get(&self, record_id: &str) -> DbResult<Option<QueueRecord>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM offline_queue WHERE record_id = ?1");

        let row: Option<QueueRow> = sqlx::query_as(&sql)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(QueueRecord::try_from).transpose()
    }

    /// Lists an agent's records in `status`, in delivery order:
    /// priority (high first), then `collected_at`, then insertion order.
    pub async fn list_by_status(
        &self,
        agent_id: &str,
        status: RecordStatus,
    ) -> DbResult<Vec<QueueRecord>> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM offline_queue
            WHERE agent_id = ?1 AND status = ?2
            ORDER BY
                CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END,
                collected_at ASC,
                rowid ASC
            "#
        );

        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(agent_id)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(QueueRecord::try_from).collect()
    }

    /// Counts an agent's records in `status`.
    pub async fn count_by_status(&self, agent_id: &str, status: RecordStatus) -> DbResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM offline_queue WHERE agent_id = ?1 AND status = ?2",
        )
        .bind(agent_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    /// Deletes an agent's records in `status`. Returns the number removed.
    pub async fn delete_by_status(&self, agent_id: &str, status: RecordStatus) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM offline_queue WHERE agent_id = ?1 AND status = ?2")
            .bind(agent_id)
            .bind(status)
            .execute(&self.pool)
            .await?;

        debug!(agent_id, %status, removed = result.rows_affected(), "Purged queue records");
        Ok(result.rows_affected())
    }

    /// Deletes every record of an agent. Returns the number removed.
    pub async fn delete_all(&self, agent_id: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM offline_queue WHERE agent_id = ?1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;

        debug!(agent_id, removed = result.rows_affected(), "Purged whole queue");
        Ok(result.rows_affected())
    }

    /// Counts by status and by type, plus the collected_at range.
    pub async fn stats(&self, agent_id: &str) -> DbResult<QueueStats> {
        let groups: Vec<StatsRow> = sqlx::query_as(
            r#"
            SELECT record_type, status, COUNT(*) AS count
            FROM offline_queue
            WHERE agent_id = ?1
            GROUP BY record_type, status
            ORDER BY record_type
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for group in groups {
            stats.add(&group.record_type, group.status, group.count as u64);
        }

        let (oldest, newest): (Option<String>, Option<String>) = sqlx::query_as(
            "SELECT MIN(collected_at), MAX(collected_at) FROM offline_queue WHERE agent_id = ?1",
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;

        stats.oldest_collected_at = oldest.as_deref().map(parse_timestamp).transpose()?;
        stats.newest_collected_at = newest.as_deref().map(parse_timestamp).transpose()?;

        Ok(stats)
    }
}

fn parse_timestamp(raw: &str) -> DbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DbError::InvalidData(format!("timestamp '{raw}': {e}")))
}

// =============================================================================
// Unit Tests
// =============================================================================
