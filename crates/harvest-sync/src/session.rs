//! # Session Tracker
//!
//! Audit trail of orchestrated passes. Callers treat failures here as
//! best-effort: the orchestrator logs them and keeps delivering.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use harvest_core::{NetworkStatus, SessionResults, SyncSession};
use harvest_db::{Database, DbError, SessionRepository};

use crate::error::{Result, SyncError};

/// Starts and completes [`SyncSession`] rows.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    repo: SessionRepository,
}

impl SessionTracker {
    pub fn new(db: &Database) -> Self {
        SessionTracker {
            repo: db.sessions(),
        }
    }

    /// Persists a new in-progress session started at `at`.
    pub async fn start_session(
        &self,
        agent_id: &str,
        device_id: &str,
        network_status: NetworkStatus,
        at: DateTime<Utc>,
    ) -> Result<SyncSession> {
        let mut session = SyncSession::start(agent_id, device_id, network_status);
        session.started_at = at;

        self.repo
            .insert(&session)
            .await
            .map_err(|e| SyncError::SessionFailed(e.to_string()))?;

        debug!(session_id = %session.session_id, %network_status, "Session started");
        Ok(session)
    }

    /// Finalizes a session exactly once.
    pub async fn complete_session(
        &self,
        session: &mut SyncSession,
        results: &SessionResults,
        at: DateTime<Utc>,
    ) -> Result<()> {
        session
            .complete(results, at)
            .map_err(|e| SyncError::SessionFailed(e.to_string()))?;

        self.repo.complete(session).await.map_err(|e| match e {
            DbError::Closed { id, .. } => {
                SyncError::SessionFailed(format!("Session {id} is already completed"))
            }
            other => SyncError::SessionFailed(other.to_string()),
        })?;

        info!(
            session_id = %session.session_id,
            status = %session.status,
            uploaded = session.records_uploaded,
            failed = session.records_failed,
            duration_ms = ?session.duration_ms,
            "Session completed"
        );
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SyncSession>> {
        Ok(self.repo.get(session_id).await?)
    }

    /// Sessions of `agent_id` started at or after `since`, newest first.
    pub async fn history(&self, agent_id: &str, since: DateTime<Utc>) -> Result<Vec<SyncSession>> {
        Ok(self.repo.history(agent_id, since).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_db, AGENT, DEVICE};
    use harvest_core::SessionStatus;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let db = memory_db().await;
        let tracker = SessionTracker::new(&db);
        let start = Utc::now();

        let mut session = tracker
            .start_session(AGENT, DEVICE, NetworkStatus::Online, start)
            .await
            .unwrap();
        assert_eq!(session.started_at, start);

        let results = SessionResults {
            synced: 3,
            failed: 0,
            errors: vec![],
        };
        tracker
            .complete_session(&mut session, &results, start + chrono::Duration::seconds(2))
            .await
            .unwrap();

        let stored = tracker.get(&session.session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.records_uploaded, 3);
        assert_eq!(stored.duration_ms, Some(2000));
    }

    #[tokio::test]
    async fn test_completed_session_cannot_reopen() {
        let db = memory_db().await;
        let tracker = SessionTracker::new(&db);

        let mut session = tracker
            .start_session(AGENT, DEVICE, NetworkStatus::Limited, Utc::now())
            .await
            .unwrap();
        tracker
            .complete_session(&mut session, &SessionResults::default(), Utc::now())
            .await
            .unwrap();

        let err = tracker
            .complete_session(&mut session, &SessionResults::default(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionFailed(_)));

        // A stale copy that still looks open is refused by storage.
        let mut stale = session.clone();
        stale.completed_at = None;
        let failed = SessionResults {
            synced: 0,
            failed: 2,
            errors: vec!["late".into()],
        };
        assert!(tracker
            .complete_session(&mut stale, &failed, Utc::now())
            .await
            .is_err());

        let stored = tracker.get(&session.session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.records_failed, 0);
    }
}
