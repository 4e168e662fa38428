//! # Queue Store
//!
//! The offline queue of one agent on one device. Owns enqueue validation,
//! the record state machine as seen from storage, purges and stats.
//!
//! ## Record Lifecycle
//! ```text
//!   enqueue ──► PENDING ──deliver ok──► SYNCED ──purge_synced──► (gone)
//!                 │  ▲
//!     deliver     │  │ next pass / requeue_failed (budget left)
//!     failed      ▼  │
//!               FAILED ──purge_failed──► (gone)
//! ```
//!
//! A record is never dropped implicitly: only an explicit purge deletes it.
//!
//! ## Leases
//! Delivery takes a [`RecordLease`] first. A lease is exclusive per
//! `record_id` across every clone of the store and is released on drop, so
//! two passes can never deliver the same record at the same time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use harvest_core::validation::{validate_payload_size, validate_record_tag};
use harvest_core::{
    Payload, Priority, QueueRecord, QueueStats, RecordStatus, RecordType, ValidationError,
    METADATA_PRIORITY,
};
use harvest_db::{Database, QueueRepository};

use crate::error::{Result, SyncError};

/// Outcome of [`QueueStore::requeue_failed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeueSummary {
    /// Failed records moved back to pending.
    pub requeued: u64,
    /// Failed records left alone because their attempt budget is spent.
    pub exhausted: u64,
}

/// Handle on the offline queue of one agent.
#[derive(Debug, Clone)]
pub struct QueueStore {
    repo: QueueRepository,
    agent_id: String,
    device_id: String,
    leases: Arc<Mutex<HashSet<String>>>,
}

impl QueueStore {
    pub fn new(db: &Database, agent_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        QueueStore {
            repo: db.queue(),
            agent_id: agent_id.into(),
            device_id: device_id.into(),
            leases: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Validates and queues a new pending record.
    ///
    /// `record_type` may be any well-formed tag; unknown tags are kept and
    /// delivered through the generic handler. An unknown
    /// `metadata.priority` falls back to normal.
    pub async fn enqueue(
        &self,
        record_type: &str,
        payload: Payload,
        subject_id: Option<i64>,
        metadata: Option<Payload>,
    ) -> Result<QueueRecord> {
        validate_record_tag(record_type)?;
        validate_payload_size(&payload)?;
        if let Some(id) = subject_id {
            if id <= 0 {
                return Err(ValidationError::OutOfRange {
                    field: "subject_id".to_string(),
                    min: 1,
                    max: i64::MAX,
                }
                .into());
            }
        }

        if let Some(raw) = metadata
            .as_ref()
            .and_then(|m| m.get(METADATA_PRIORITY))
        {
            let valid = raw.as_str().is_some_and(|p| p.parse::<Priority>().is_ok());
            if !valid {
                warn!(priority = %raw, "Unknown priority in metadata, using normal");
            }
        }

        let record = QueueRecord::new(
            self.agent_id.clone(),
            self.device_id.clone(),
            RecordType::parse(record_type),
            payload,
            subject_id,
            metadata,
        );
        self.repo.insert(&record).await?;

        info!(
            record_id = %record.record_id,
            record_type = %record.record_type,
            priority = %record.priority,
            "Record queued"
        );
        Ok(record)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, record_id: &str) -> Result<Option<QueueRecord>> {
        Ok(self.repo.get(record_id).await?)
    }

    /// Pending records in delivery order (priority, then age).
    pub async fn list_pending(&self) -> Result<Vec<QueueRecord>> {
        Ok(self
            .repo
            .list_by_status(&self.agent_id, RecordStatus::Pending)
            .await?)
    }

    pub async fn list_failed(&self) -> Result<Vec<QueueRecord>> {
        Ok(self
            .repo
            .list_by_status(&self.agent_id, RecordStatus::Failed)
            .await?)
    }

    pub async fn count(&self, status: RecordStatus) -> Result<u64> {
        Ok(self.repo.count_by_status(&self.agent_id, status).await?)
    }

    /// Pending plus failed records.
    pub async fn active_count(&self) -> Result<u64> {
        Ok(self.count(RecordStatus::Pending).await? + self.count(RecordStatus::Failed).await?)
    }

    /// Counts by status and type.
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self.repo.stats(&self.agent_id).await?)
    }

    // =========================================================================
    // State Changes
    // =========================================================================

    /// Writes back the delivery fields of a record.
    pub async fn save(&self, record: &QueueRecord) -> Result<()> {
        Ok(self.repo.save(record).await?)
    }

    /// `pending → synced` for a stored record.
    pub async fn mark_synced(&self, record_id: &str, at: DateTime<Utc>) -> Result<QueueRecord> {
        let mut record = self.load(record_id).await?;
        record.mark_synced(at)?;
        self.repo.save(&record).await?;
        Ok(record)
    }

    /// `pending → failed` for a stored record.
    pub async fn mark_failed(&self, record_id: &str, reason: &str) -> Result<QueueRecord> {
        let mut record = self.load(record_id).await?;
        record.mark_failed(reason)?;
        self.repo.save(&record).await?;
        Ok(record)
    }

    /// Moves failed records with attempt budget left back to pending.
    /// Attempts are kept.
    pub async fn requeue_failed(&self, max_retries: u32) -> Result<RequeueSummary> {
        self.requeue_where(max_retries, false).await
    }

    /// Same as [`requeue_failed`](Self::requeue_failed), but records whose
    /// payload no longer matches its checksum stay failed.
    pub async fn reopen_for_pass(
        &self,
        max_retries: u32,
        checksum_validation: bool,
    ) -> Result<RequeueSummary> {
        self.requeue_where(max_retries, checksum_validation).await
    }

    async fn requeue_where(&self, max_retries: u32, skip_tampered: bool) -> Result<RequeueSummary> {
        let mut summary = RequeueSummary::default();

        for mut record in self.list_failed().await? {
            if !record.has_retry_budget(max_retries) {
                debug!(
                    record_id = %record.record_id,
                    attempts = record.attempts,
                    "Retry budget spent, leaving record failed"
                );
                summary.exhausted += 1;
                continue;
            }
            if skip_tampered && !record.verify_checksum() {
                debug!(record_id = %record.record_id, "Payload suspect, leaving record failed");
                summary.exhausted += 1;
                continue;
            }
            record.requeue(max_retries)?;
            self.repo.save(&record).await?;
            summary.requeued += 1;
        }

        info!(
            requeued = summary.requeued,
            exhausted = summary.exhausted,
            "Requeued failed records"
        );
        Ok(summary)
    }

    /// Fills in `subject_id` from the record named by `subject_ref`.
    ///
    /// Returns true if the record changed. The referenced record must already
    /// have been delivered; otherwise the record is left as is.
    pub async fn resolve_subject(&self, record: &mut QueueRecord) -> Result<bool> {
        if record.subject_id.is_some() {
            return Ok(false);
        }
        let Some(reference) = record.subject_ref.as_deref() else {
            return Ok(false);
        };

        let resolved = self.repo.get(reference).await?.and_then(|r| r.subject_id);
        match resolved {
            Some(subject_id) => {
                debug!(
                    record_id = %record.record_id,
                    subject_ref = reference,
                    subject_id,
                    "Resolved subject reference"
                );
                record.subject_id = Some(subject_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Purges
    // =========================================================================

    pub async fn purge_synced(&self) -> Result<u64> {
        Ok(self
            .repo
            .delete_by_status(&self.agent_id, RecordStatus::Synced)
            .await?)
    }

    pub async fn purge_failed(&self) -> Result<u64> {
        Ok(self
            .repo
            .delete_by_status(&self.agent_id, RecordStatus::Failed)
            .await?)
    }

    /// Deletes the whole queue of the agent, whatever the status.
    pub async fn purge_all(&self) -> Result<u64> {
        warn!(agent_id = %self.agent_id, "Purging entire offline queue");
        Ok(self.repo.delete_all(&self.agent_id).await?)
    }

    // =========================================================================
    // Leases
    // =========================================================================

    /// Takes the delivery lease of a record, or `None` if another delivery
    /// holds it.
    pub fn try_lease(&self, record_id: &str) -> Option<RecordLease> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if !leases.insert(record_id.to_string()) {
            return None;
        }
        Some(RecordLease {
            record_id: record_id.to_string(),
            leases: Arc::clone(&self.leases),
        })
    }

    async fn load(&self, record_id: &str) -> Result<QueueRecord> {
        self.repo
            .get(record_id)
            .await?
            .ok_or_else(|| SyncError::from(harvest_db::DbError::not_found("QueueRecord", record_id)))
    }
}

/// Exclusive right to deliver one record; released on drop.
#[derive(Debug)]
pub struct RecordLease {
    record_id: String,
    leases: Arc<Mutex<HashSet<String>>>,
}

impl RecordLease {
    pub fn record_id(&self) -> &str {
        &self.record_id
    }
}

impl Drop for RecordLease {
    fn drop(&mut self) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.remove(&self.record_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_db, metadata, object, AGENT, DEVICE};
    use serde_json::json;

    async fn store() -> QueueStore {
        let db = memory_db().await;
        QueueStore::new(&db, AGENT, DEVICE)
    }

    #[tokio::test]
    async fn test_enqueue_sets_initial_state() {
        let store = store().await;
        let payload = object(json!({"lat": 25.03, "lon": -77.39}));

        let record = store
            .enqueue("location", payload.clone(), Some(42), None)
            .await
            .unwrap();

        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.priority, Priority::Normal);
        assert_eq!(record.checksum, harvest_core::compute_checksum(&payload));

        let stored = store.get(&record.record_id).await.unwrap().unwrap();
        assert_eq!(stored.payload, payload);
        assert_eq!(stored.checksum, record.checksum);
        assert_eq!(stored.subject_id, Some(42));
        assert!(stored.verify_checksum());
    }

    #[tokio::test]
    async fn test_computed_coordinates_verify_after_reload() {
        let store = store().await;
        let payload = object(json!({"lat": 25.0 + 5884.0 / 1e6, "lon": -77.39, "accuracy_m": 0.1 + 0.2}));

        let record = store.enqueue("location", payload.clone(), Some(42), None).await.unwrap();

        let stored = store.get(&record.record_id).await.unwrap().unwrap();
        assert_eq!(stored.payload, payload);
        assert!(stored.verify_checksum());
    }

    #[tokio::test]
    async fn test_enqueue_reads_metadata() {
        let store = store().await;
        let record = store
            .enqueue(
                "household",
                object(json!({"household_size": 3})),
                None,
                Some(metadata("high", Some("profile-1"))),
            )
            .await
            .unwrap();

        assert_eq!(record.priority, Priority::High);
        assert_eq!(record.subject_ref.as_deref(), Some("profile-1"));
    }

    #[tokio::test]
    async fn test_unknown_priority_falls_back_to_normal() {
        let store = store().await;
        let record = store
            .enqueue("household", Payload::new(), None, Some(metadata("urgent", None)))
            .await
            .unwrap();
        assert_eq!(record.priority, Priority::Normal);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_bad_input() {
        let store = store().await;

        let err = store
            .enqueue("bad tag!", Payload::new(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRecord(_)));

        let err = store
            .enqueue("location", Payload::new(), Some(0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRecord(_)));

        assert_eq!(store.active_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_type_is_kept() {
        let store = store().await;
        let record = store
            .enqueue("livestock_poultry", object(json!({"goats": 2})), None, None)
            .await
            .unwrap();
        assert_eq!(record.record_type.as_str(), "livestock_poultry");
        assert!(record.record_type.is_generic());
    }

    #[tokio::test]
    async fn test_mark_and_purge() {
        let store = store().await;
        let a = store.enqueue("location", Payload::new(), Some(1), None).await.unwrap();
        let b = store.enqueue("location", Payload::new(), Some(2), None).await.unwrap();
        let c = store.enqueue("location", Payload::new(), Some(3), None).await.unwrap();

        store.mark_synced(&a.record_id, Utc::now()).await.unwrap();
        let failed = store.mark_failed(&b.record_id, "boom").await.unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("boom"));

        // synced is terminal
        assert!(matches!(
            store.mark_failed(&a.record_id, "late").await,
            Err(SyncError::RecordState(_))
        ));

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.total, stats.pending, stats.failed, stats.synced), (3, 1, 1, 1));
        assert_eq!(stats.by_type["location"].total, 3);

        assert_eq!(store.purge_synced().await.unwrap(), 1);
        assert_eq!(store.purge_failed().await.unwrap(), 1);
        assert!(store.get(&c.record_id).await.unwrap().is_some());
        assert_eq!(store.purge_all().await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_requeue_keeps_attempts_and_respects_budget() {
        let store = store().await;
        let spent = store.enqueue("household", Payload::new(), Some(1), None).await.unwrap();
        let fresh = store.enqueue("household", Payload::new(), Some(2), None).await.unwrap();

        for (id, attempts) in [(&spent.record_id, 3), (&fresh.record_id, 1)] {
            let mut record = store.get(id).await.unwrap().unwrap();
            record.attempts = attempts;
            record.mark_failed("sink down").unwrap();
            store.save(&record).await.unwrap();
        }

        let summary = store.requeue_failed(3).await.unwrap();
        assert_eq!(summary, RequeueSummary { requeued: 1, exhausted: 1 });

        let requeued = store.get(&fresh.record_id).await.unwrap().unwrap();
        assert_eq!(requeued.status, RecordStatus::Pending);
        assert_eq!(requeued.attempts, 1);
        assert!(requeued.error_message.is_none());

        let left = store.get(&spent.record_id).await.unwrap().unwrap();
        assert_eq!(left.status, RecordStatus::Failed);
    }

    #[tokio::test]
    async fn test_reopen_for_pass_leaves_tampered_records_failed() {
        let db = memory_db().await;
        let store = QueueStore::new(&db, AGENT, DEVICE);
        let intact = store.enqueue("household", object(json!({"size": 3})), Some(1), None).await.unwrap();
        let tampered = store.enqueue("household", object(json!({"size": 4})), Some(2), None).await.unwrap();

        for id in [&intact.record_id, &tampered.record_id] {
            let mut record = store.get(id).await.unwrap().unwrap();
            record.attempts = 1;
            record.mark_failed("sink down").unwrap();
            store.save(&record).await.unwrap();
        }
        sqlx::query("UPDATE offline_queue SET payload = ?1 WHERE record_id = ?2")
            .bind(r#"{"size":40}"#)
            .bind(&tampered.record_id)
            .execute(db.pool())
            .await
            .unwrap();

        let summary = store.reopen_for_pass(3, true).await.unwrap();
        assert_eq!(summary, RequeueSummary { requeued: 1, exhausted: 1 });
        assert_eq!(
            store.get(&intact.record_id).await.unwrap().unwrap().status,
            RecordStatus::Pending
        );
        assert_eq!(
            store.get(&tampered.record_id).await.unwrap().unwrap().status,
            RecordStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_resolve_subject_from_reference() {
        let store = store().await;
        let profile = store
            .enqueue("subject_profile", object(json!({"name": "A"})), None, None)
            .await
            .unwrap();
        let mut household = store
            .enqueue(
                "household",
                Payload::new(),
                None,
                Some(metadata("normal", Some(&profile.record_id))),
            )
            .await
            .unwrap();

        // Not delivered yet: nothing to resolve.
        assert!(!store.resolve_subject(&mut household).await.unwrap());

        let mut delivered = store.get(&profile.record_id).await.unwrap().unwrap();
        delivered.subject_id = Some(17);
        store.save(&delivered).await.unwrap();

        assert!(store.resolve_subject(&mut household).await.unwrap());
        assert_eq!(household.subject_id, Some(17));
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_across_clones() {
        let store = store().await;
        let other = store.clone();

        let lease = store.try_lease("r-1").unwrap();
        assert_eq!(lease.record_id(), "r-1");
        assert!(other.try_lease("r-1").is_none());
        assert!(other.try_lease("r-2").is_some());

        drop(lease);
        assert!(other.try_lease("r-1").is_some());
    }
}
