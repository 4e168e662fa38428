//! # Sync Session Repository
//!
//! Persistent audit trail of sync passes. A session row is written once at
//! start and completed exactly once; the completion update is guarded in SQL
//! so a completed row can never be rewritten.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use harvest_core::{NetworkStatus, SessionStatus, SyncSession};

const SELECT_COLUMNS: &str = r#"
    session_id, agent_id, device_id, network_status, started_at, completed_at,
    records_uploaded, records_failed, total_records, status, error_details, duration_ms
"#;

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    agent_id: String,
    device_id: String,
    network_status: NetworkStatus,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    records_uploaded: i64,
    records_failed: i64,
    total_records: i64,
    status: SessionStatus,
    error_details: String,
    duration_ms: Option<i64>,
}

impl TryFrom<SessionRow> for SyncSession {
    type Error = DbError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(SyncSession {
            session_id: row.session_id,
            agent_id: row.agent_id,
            device_id: row.device_id,
            network_status: row.network_status,
            started_at: row.started_at,
            completed_at: row.completed_at,
            records_uploaded: row.records_uploaded,
            records_failed: row.records_failed,
            total_records: row.total_records,
            status: row.status,
            error_details: serde_json::from_str(&row.error_details)?,
            duration_ms: row.duration_ms,
        })
    }
}

/// Repository for sync session rows.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SessionRepository { pool }
    }

    /// Persists a newly started session.
    pub async fn insert(&self, session: &SyncSession) -> DbResult<()> {
        debug!(session_id = %session.session_id, "Recording session start");

        sqlx::query(
            r#"
            INSERT INTO sync_sessions (
                session_id, agent_id, device_id, network_status, started_at,
                status, error_details
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.agent_id)
        .bind(&session.device_id)
        .bind(session.network_status)
        .bind(session.started_at)
        .bind(session.status)
        .bind(serde_json::to_string(&session.error_details)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persists the completion fields.
    ///
    /// Fails with [`DbError::Closed`] if the stored row is already complete
    /// and with [`DbError::NotFound`] if it was never started.
    pub async fn complete(&self, session: &SyncSession) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_sessions SET
                completed_at = ?2,
                records_uploaded = ?3,
                records_failed = ?4,
                total_records = ?5,
                status = ?6,
                error_details = ?7,
                duration_ms = ?8
            WHERE session_id = ?1 AND completed_at IS NULL
            "#,
        )
        .bind(&session.session_id)
        .bind(session.completed_at)
        .bind(session.records_uploaded)
        .bind(session.records_failed)
        .bind(session.total_records)
        .bind(session.status)
        .bind(serde_json::to_string(&session.error_details)?)
        .bind(session.duration_ms)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(&session.session_id).await? {
                Some(_) => Err(DbError::Closed {
                    entity: "SyncSession".to_string(),
                    id: session.session_id.clone(),
                }),
                None => Err(DbError::not_found("SyncSession", &session.session_id)),
            };
        }

        debug!(
            session_id = %session.session_id,
            status = %session.status,
            "Recorded session completion"
        );
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> DbResult<Option<SyncSession>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_sessions WHERE session_id = ?1");

        let row: Option<SessionRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SyncSession::try_from).transpose()
    }

    /// Sessions of an agent started at or after `since`, newest first.
    pub async fn history(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> DbResult<Vec<SyncSession>> {
        let sql = format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM sync_sessions
            WHERE agent_id = ?1 AND started_at >= ?2
            ORDER BY started_at DESC
            "#
        );

        let rows: Vec<SessionRow> = sqlx::query_as(&sql)
            .bind(agent_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(SyncSession::try_from).collect()
    }
}
