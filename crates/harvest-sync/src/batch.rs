//! # Batch Processor
//!
//! Orders the records of a pass, cuts them into batches and delivers each
//! record with integrity check, retry and backoff.
//!
//! ## Delivery Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       BatchProcessor::run                               │
//! │                                                                         │
//! │  1. Order:  priority (high < normal < low), then collected_at.          │
//! │             A record that references a subject created by another       │
//! │             record of the pass is moved behind that record.             │
//! │                                                                         │
//! │  2. Chunk:  batches of `batch_size`; pause `batch_pause` between.       │
//! │             No batch starts after the pass deadline.                    │
//! │                                                                         │
//! │  3. Deliver each record in order:                                       │
//! │                                                                         │
//! │     lease ──► checksum ok? ──no──► FAILED "integrity check failed"     │
//! │                   │                (attempts unchanged)                 │
//! │                  yes                                                    │
//! │                   ▼                                                     │
//! │     resolve subject_ref ──► attempts += 1 ──► TypeRouter::route         │
//! │                                  ▲                 │                    │
//! │                                  │         ok ─────┴──► SYNCED          │
//! │              sleep retry_delay * 2^n       │                            │
//! │                                  │         err                          │
//! │                                  │          ▼                           │
//! │                      retryable + budget left? ──no──► FAILED            │
//! │                                  │                                      │
//! │                     backoff ends past deadline? ──yes──► stays PENDING  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every per-record error is folded into the [`BatchReport`]; nothing
//! escapes `run`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use harvest_core::{QueueRecord, RecordStatus};

use crate::clock::{to_chrono, Scheduler};
use crate::config::SyncSettings;
use crate::error::{Result, SyncError};
use crate::queue::QueueStore;
use crate::retry::RetryPolicy;
use crate::router::TypeRouter;

/// How one record left `deliver`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Synced,
    /// Record is now failed; carries the error entry for the pass result.
    Failed(String),
    /// Backoff would end past the deadline; record stays pending.
    Deferred,
    /// Another delivery holds the record's lease.
    Skipped,
}

/// Aggregate of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub synced: u64,
    pub failed: u64,
    /// Left pending by the deadline.
    pub deferred: u64,
    pub skipped: u64,
    /// Delivery stopped on a storage error; the stored record keeps its
    /// last saved state.
    pub unsettled: u64,
    pub batches: usize,
    pub errors: Vec<String>,
    pub timed_out: bool,
}

/// Progress after each batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub processed: u64,
    pub total: u64,
    pub synced: u64,
    pub failed: u64,
}

/// Drives delivery of a set of records.
#[derive(Clone)]
pub struct BatchProcessor {
    store: QueueStore,
    router: TypeRouter,
    scheduler: Arc<dyn Scheduler>,
    policy: RetryPolicy,
    batch_size: usize,
    batch_pause: Duration,
    checksum_validation: bool,
}

impl BatchProcessor {
    pub fn new(
        store: QueueStore,
        router: TypeRouter,
        scheduler: Arc<dyn Scheduler>,
        settings: &SyncSettings,
    ) -> Self {
        BatchProcessor {
            store,
            router,
            scheduler,
            policy: RetryPolicy::from_settings(settings),
            batch_size: settings.batch_size.max(1),
            batch_pause: settings.batch_pause(),
            checksum_validation: settings.checksum_validation,
        }
    }

    /// Delivers `records` in batches.
    ///
    /// No batch starts once `deadline` has passed; the records it would have
    /// held stay pending and the report is marked `timed_out`.
    pub async fn run<F>(
        &self,
        records: Vec<QueueRecord>,
        deadline: Option<DateTime<Utc>>,
        mut on_progress: F,
    ) -> BatchReport
    where
        F: FnMut(BatchProgress) + Send,
    {
        let records = order_for_delivery(records);
        let total = records.len() as u64;
        let mut report = BatchReport::default();
        let mut processed = 0u64;

        let batches: Vec<&[QueueRecord]> = records.chunks(self.batch_size).collect();
        let batch_count = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            if index > 0 && !self.batch_pause.is_zero() {
                self.scheduler.sleep(self.batch_pause).await;
            }

            if deadline.is_some_and(|d| self.scheduler.now() >= d) {
                warn!(
                    batch = index + 1,
                    remaining = total - processed,
                    "Pass deadline reached, leaving remaining records pending"
                );
                report.timed_out = true;
                break;
            }

            debug!(batch = index + 1, of = batch_count, size = batch.len(), "Processing batch");
            report.batches += 1;

            for record in batch {
                let mut record = record.clone();
                match self.deliver(&mut record, deadline).await {
                    Ok(Delivery::Synced) => report.synced += 1,
                    Ok(Delivery::Failed(entry)) => {
                        report.failed += 1;
                        report.errors.push(entry);
                    }
                    Ok(Delivery::Deferred) => {
                        report.deferred += 1;
                        report.timed_out = true;
                    }
                    Ok(Delivery::Skipped) => report.skipped += 1,
                    Err(e) => {
                        error!(record_id = %record.record_id, error = %e, "Delivery aborted");
                        report.unsettled += 1;
                        report.errors.push(format!(
                            "Failed to sync {} (attempt {}): {}",
                            record.record_type, record.attempts, e
                        ));
                    }
                }
                processed += 1;
            }

            on_progress(BatchProgress {
                processed,
                total,
                synced: report.synced,
                failed: report.failed,
            });
        }

        info!(
            synced = report.synced,
            failed = report.failed,
            deferred = report.deferred,
            unsettled = report.unsettled,
            batches = report.batches,
            "Batch run finished"
        );
        report
    }

    /// Delivers one pending record, retrying in place.
    pub async fn deliver(
        &self,
        record: &mut QueueRecord,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Delivery> {
        let Some(_lease) = self.store.try_lease(&record.record_id) else {
            debug!(record_id = %record.record_id, "Record leased elsewhere, skipping");
            return Ok(Delivery::Skipped);
        };

        if record.status != RecordStatus::Pending {
            return Ok(Delivery::Skipped);
        }

        if self.checksum_validation && !record.verify_checksum() {
            let err = SyncError::IntegrityCheckFailed {
                record_id: record.record_id.clone(),
            };
            warn!(record_id = %record.record_id, "Payload checksum mismatch");
            record.mark_failed(err.to_string())?;
            self.store.save(record).await?;
            return Ok(Delivery::Failed(format!(
                "Failed to sync {}: {}",
                record.record_type, err
            )));
        }

        self.store.resolve_subject(record).await?;

        let mut backoff = self.policy.backoff_from(record.attempts);
        loop {
            record.record_attempt(self.scheduler.now());

            let err = match self.router.route(record).await {
                Ok(outcome) => {
                    if let Some(id) = outcome.assigned_subject_id {
                        record.subject_id = Some(id);
                    }
                    if let Some(id) = outcome.assigned_assignment_id {
                        record.assignment_id = Some(id);
                    }
                    record.mark_synced(self.scheduler.now())?;
                    self.store.save(record).await?;
                    debug!(
                        record_id = %record.record_id,
                        attempts = record.attempts,
                        subject_id = ?record.subject_id,
                        "Record synced"
                    );
                    return Ok(Delivery::Synced);
                }
                Err(err) => err,
            };

            let entry = format!(
                "Failed to sync {} (attempt {}): {}",
                record.record_type, record.attempts, err
            );

            if !err.is_retryable() || !self.policy.allows_attempt(record.attempts) {
                warn!(
                    record_id = %record.record_id,
                    attempts = record.attempts,
                    error = %err,
                    "Record failed"
                );
                record.mark_failed(err.to_string())?;
                self.store.save(record).await?;
                return Ok(Delivery::Failed(entry));
            }

            let delay = backoff.next_delay();
            record.error_message = Some(err.to_string());

            if deadline.is_some_and(|d| self.scheduler.now() + to_chrono(delay) > d) {
                warn!(
                    record_id = %record.record_id,
                    attempts = record.attempts,
                    delay_secs = delay.as_secs(),
                    "Backoff ends past the pass deadline, deferring record"
                );
                self.store.save(record).await?;
                return Ok(Delivery::Deferred);
            }

            debug!(
                record_id = %record.record_id,
                attempts = record.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Delivery failed, backing off"
            );
            self.store.save(record).await?;
            self.scheduler.sleep(delay).await;
        }
    }
}

/// Sorts by priority rank then age, then moves every record that references
/// another record of the set behind it.
pub fn order_for_delivery(mut records: Vec<QueueRecord>) -> Vec<QueueRecord> {
    records.sort_by(|a, b| {
        a.priority
            .rank()
            .cmp(&b.priority.rank())
            .then(a.collected_at.cmp(&b.collected_at))
    });

    let ids: HashSet<String> = records.iter().map(|r| r.record_id.clone()).collect();
    let mut placed: HashSet<String> = HashSet::with_capacity(records.len());
    let mut waiting: HashMap<String, Vec<QueueRecord>> = HashMap::new();
    let mut ordered = Vec::with_capacity(records.len());

    for record in records {
        let blocked_on = record
            .subject_ref
            .as_ref()
            .filter(|r| record.subject_id.is_none() && ids.contains(*r) && !placed.contains(*r))
            .cloned();

        match blocked_on {
            Some(reference) => waiting.entry(reference).or_default().push(record),
            None => place(record, &mut ordered, &mut placed, &mut waiting),
        }
    }

    // References that never got placed (cycles) keep their sorted order.
    let mut rest: Vec<QueueRecord> = waiting.into_values().flatten().collect();
    rest.sort_by(|a, b| {
        a.priority
            .rank()
            .cmp(&b.priority.rank())
            .then(a.collected_at.cmp(&b.collected_at))
    });
    ordered.extend(rest);
    ordered
}

fn place(
    record: QueueRecord,
    ordered: &mut Vec<QueueRecord>,
    placed: &mut HashSet<String>,
    waiting: &mut HashMap<String, Vec<QueueRecord>>,
) {
    let mut stack = vec![record];
    while let Some(next) = stack.pop() {
        placed.insert(next.record_id.clone());
        if let Some(dependents) = waiting.remove(&next.record_id) {
            stack.extend(dependents.into_iter().rev());
        }
        ordered.push(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualScheduler;
    use crate::testing::{memory_db, metadata, object, RecordingSink, AGENT, DEVICE};
    use harvest_core::{Payload, Priority, RecordType};
    use serde_json::json;

    struct Harness {
        processor: BatchProcessor,
        db: Arc<harvest_db::Database>,
        store: QueueStore,
        sink: Arc<RecordingSink>,
        scheduler: VirtualScheduler,
    }

    async fn harness(settings: SyncSettings) -> Harness {
        let db = memory_db().await;
        let store = QueueStore::new(&db, AGENT, DEVICE);
        let sink = Arc::new(RecordingSink::new());
        let scheduler = VirtualScheduler::new();
        let processor = BatchProcessor::new(
            store.clone(),
            TypeRouter::new(sink.clone()),
            Arc::new(scheduler.clone()),
            &settings,
        );
        Harness {
            processor,
            db,
            store,
            sink,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_always_failing_record_stops_at_budget() {
        let h = harness(SyncSettings::default()).await;
        h.sink.fail_always("household", "connection reset");
        let record = h
            .store
            .enqueue("household", object(json!({"dependents": 2})), Some(5), None)
            .await
            .unwrap();

        let report = h
            .processor
            .run(h.store.list_pending().await.unwrap(), None, |_| {})
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(h.sink.calls().len(), 3);
        assert_eq!(
            h.scheduler.sleeps(),
            vec![Duration::from_secs(5), Duration::from_secs(10)]
        );
        assert_eq!(
            report.errors,
            vec!["Failed to sync household (attempt 3): Sink error: connection reset"]
        );

        let stored = h.store.get(&record.record_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Failed);
        assert_eq!(stored.attempts, 3);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("Sink error: connection reset")
        );
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let h = harness(SyncSettings::default()).await;
        h.sink.fail_times("location", 1, "database is locked");
        let record = h
            .store
            .enqueue("location", object(json!({"lat": 25.0, "lon": -77.0})), Some(9), None)
            .await
            .unwrap();

        let report = h
            .processor
            .run(h.store.list_pending().await.unwrap(), None, |_| {})
            .await;

        assert_eq!((report.synced, report.failed), (1, 0));
        assert_eq!(h.scheduler.sleeps(), vec![Duration::from_secs(5)]);

        let stored = h.store.get(&record.record_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Synced);
        assert_eq!(stored.attempts, 2);
        assert!(stored.synced_at.is_some());
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_without_attempt() {
        let h = harness(SyncSettings::default()).await;
        let mut record = h
            .store
            .enqueue("location", object(json!({"lat": 25.0, "lon": -77.0})), Some(9), None)
            .await
            .unwrap();
        record.payload.insert("lat".into(), json!(26.0));

        let delivery = h.processor.deliver(&mut record, None).await.unwrap();

        assert!(matches!(delivery, Delivery::Failed(ref e) if e.contains("integrity check failed")));
        assert!(h.sink.calls().is_empty());
        let stored = h.store.get(&record.record_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Failed);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.error_message.as_deref(), Some("integrity check failed"));
    }

    #[tokio::test]
    async fn test_checksum_validation_can_be_disabled() {
        let settings = SyncSettings {
            checksum_validation: false,
            ..Default::default()
        };
        let h = harness(settings).await;
        let mut record = h
            .store
            .enqueue("location", object(json!({"lat": 25.0, "lon": -77.0})), Some(9), None)
            .await
            .unwrap();
        record.payload.insert("lat".into(), json!(26.0));

        assert_eq!(
            h.processor.deliver(&mut record, None).await.unwrap(),
            Delivery::Synced
        );
    }

    #[tokio::test]
    async fn test_permanent_error_fails_without_backoff() {
        let h = harness(SyncSettings::default()).await;
        h.store
            .enqueue("household", object(json!({"household_size": 4})), None, None)
            .await
            .unwrap();

        let report = h
            .processor
            .run(h.store.list_pending().await.unwrap(), None, |_| {})
            .await;

        assert_eq!(report.failed, 1);
        assert!(h.scheduler.sleeps().is_empty());
        assert!(report.errors[0].contains("No subject_id for household record"));
    }

    #[tokio::test]
    async fn test_high_priority_delivered_first() {
        let h = harness(SyncSettings::default()).await;
        let mut ids = Vec::new();
        for priority in ["low", "high", "normal"] {
            let record = h
                .store
                .enqueue("observation", Payload::new(), None, Some(metadata(priority, None)))
                .await
                .unwrap();
            ids.push(record.record_id);
        }

        h.processor
            .run(h.store.list_pending().await.unwrap(), None, |_| {})
            .await;

        assert_eq!(
            h.sink.delivered_ids(),
            vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]
        );
    }

    #[tokio::test]
    async fn test_batches_are_paced_and_reported() {
        let settings = SyncSettings {
            batch_size: 2,
            ..Default::default()
        };
        let h = harness(settings).await;
        for _ in 0..5 {
            h.store
                .enqueue("observation", Payload::new(), None, None)
                .await
                .unwrap();
        }

        let mut progress = Vec::new();
        let report = h
            .processor
            .run(h.store.list_pending().await.unwrap(), None, |p| {
                progress.push(p.processed)
            })
            .await;

        assert_eq!(report.batches, 3);
        assert_eq!(report.synced, 5);
        assert_eq!(progress, vec![2, 4, 5]);
        assert_eq!(h.scheduler.sleeps(), vec![Duration::from_millis(100); 2]);
    }

    #[tokio::test]
    async fn test_backoff_past_deadline_defers_record() {
        let h = harness(SyncSettings::default()).await;
        h.sink.fail_always("household", "timeout");
        let record = h
            .store
            .enqueue("household", Payload::new(), Some(5), None)
            .await
            .unwrap();
        let deadline = h.scheduler.now() + chrono::Duration::seconds(8);

        let report = h
            .processor
            .run(h.store.list_pending().await.unwrap(), Some(deadline), |_| {})
            .await;

        // 5 s backoff fits, the 10 s one does not.
        assert_eq!(h.scheduler.sleeps(), vec![Duration::from_secs(5)]);
        assert!(report.timed_out);
        assert_eq!((report.deferred, report.failed), (1, 0));

        let stored = h.store.get(&record.record_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Pending);
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn test_unsaved_outcome_is_not_counted_as_failed() {
        let h = harness(SyncSettings::default()).await;
        sqlx::query(
            "CREATE TRIGGER reject_synced BEFORE UPDATE ON offline_queue \
             WHEN NEW.status = 'synced' BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
        )
        .execute(h.db.pool())
        .await
        .unwrap();
        let record = h
            .store
            .enqueue("location", object(json!({"lat": 25.03, "lon": -77.39})), Some(42), None)
            .await
            .unwrap();

        let report = h
            .processor
            .run(h.store.list_pending().await.unwrap(), None, |_| {})
            .await;

        assert_eq!(h.sink.calls().len(), 1);
        assert_eq!((report.synced, report.failed, report.unsettled), (0, 0, 1));
        assert_eq!(report.errors.len(), 1);

        let stored = h.store.get(&record.record_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Pending);
    }

    #[tokio::test]
    async fn test_no_batch_starts_after_deadline() {
        let settings = SyncSettings {
            batch_size: 1,
            batch_pause_ms: 0,
            ..Default::default()
        };
        let h = harness(settings).await;
        h.store.enqueue("observation", Payload::new(), None, None).await.unwrap();
        let deadline = h.scheduler.now();

        let report = h
            .processor
            .run(h.store.list_pending().await.unwrap(), Some(deadline), |_| {})
            .await;

        assert!(report.timed_out);
        assert_eq!(report.batches, 0);
        assert!(h.sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_leased_record_is_skipped() {
        let h = harness(SyncSettings::default()).await;
        let mut record = h
            .store
            .enqueue("observation", Payload::new(), None, None)
            .await
            .unwrap();

        let _held = h.store.try_lease(&record.record_id).unwrap();
        assert_eq!(
            h.processor.deliver(&mut record, None).await.unwrap(),
            Delivery::Skipped
        );
        assert!(h.sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_subject_reference_resolved_within_pass() {
        let h = harness(SyncSettings::default()).await;
        let profile = h
            .store
            .enqueue(
                "subject_profile",
                object(json!({"name": "Holder 0001"})),
                None,
                Some(metadata("low", None)),
            )
            .await
            .unwrap();
        let household = h
            .store
            .enqueue(
                "household",
                object(json!({"household_size": 5})),
                None,
                Some(metadata("high", Some(profile.record_id.as_str()))),
            )
            .await
            .unwrap();

        let report = h
            .processor
            .run(h.store.list_pending().await.unwrap(), None, |_| {})
            .await;
        assert_eq!((report.synced, report.failed), (2, 0));

        let profile = h.store.get(&profile.record_id).await.unwrap().unwrap();
        let household = h.store.get(&household.record_id).await.unwrap().unwrap();
        assert!(profile.subject_id.is_some());
        assert_eq!(household.subject_id, profile.subject_id);
    }

    #[test]
    fn test_order_for_delivery() {
        fn make(priority: Priority, subject_ref: Option<&str>) -> QueueRecord {
            let mut record = QueueRecord::new(
                AGENT,
                DEVICE,
                RecordType::Household,
                Payload::new(),
                None,
                None,
            );
            record.priority = priority;
            record.subject_ref = subject_ref.map(str::to_string);
            record
        }

        let parent = make(Priority::Low, None);
        let child = make(Priority::High, Some(parent.record_id.as_str()));
        let urgent = make(Priority::High, None);
        let outside = make(Priority::High, Some("not-in-this-pass"));

        let ordered = order_for_delivery(vec![
            parent.clone(),
            child.clone(),
            urgent.clone(),
            outside.clone(),
        ]);
        let ids: Vec<&str> = ordered.iter().map(|r| r.record_id.as_str()).collect();

        assert_eq!(
            ids,
            vec![
                urgent.record_id.as_str(),
                outside.record_id.as_str(),
                parent.record_id.as_str(),
                child.record_id.as_str(),
            ]
        );
    }
}
