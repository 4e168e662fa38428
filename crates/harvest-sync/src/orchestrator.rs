//! # Sync Orchestrator
//!
//! Top-level entry point of the engine. Owns the queue handle, applies the
//! gates, runs one pass at a time and turns every outcome into a
//! [`SyncResult`].
//!
//! ## Pass Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     SyncOrchestrator::attempt_sync                      │
//! │                                                                         │
//! │  GATES (in order):                                                      │
//! │  ─────────────────                                                      │
//! │  1. nothing pending or failed, !force     → success, zero counts        │
//! │  2. network offline, no override          → "network offline"           │
//! │  3. last pass within cooldown, !force     → "rate limited"              │
//! │  4. another pass running                  → "sync already in progress"  │
//! │                                                                         │
//! │  PASS:                                                                  │
//! │  ─────                                                                  │
//! │  start session (best effort)                                            │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  BatchProcessor::run(pending + failed, deadline)  ◄── panics caught     │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  complete session (best effort) ──► status + events ──► SyncResult      │
//! │                                                                         │
//! │  EVENTS (to the field app):                                             │
//! │  ──────────────────────────                                             │
//! │  status   - SyncStatus snapshot after every pass and setting change     │
//! │  progress - { processed, total } after every batch                      │
//! │  error    - { message, retryable } for failed or aborted passes         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `attempt_sync` and `retry_failed` never return an error: gating, storage
//! failures and panics inside a pass all come back as an unsuccessful
//! [`SyncResult`].

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use harvest_core::{
    GateReason, NetworkStatus, Payload, QueueRecord, QueueStats, RecordStatus, SessionResults,
    SyncResult, SyncSession,
};
use harvest_db::Database;

use crate::batch::{BatchProcessor, BatchReport};
use crate::clock::{to_chrono, Scheduler, TokioScheduler};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::queue::{QueueStore, RequeueSummary};
use crate::router::TypeRouter;
use crate::session::SessionTracker;
use crate::sink::{DataSink, SqliteSink};

/// Size of the in-memory error log.
const RECENT_ERRORS_CAPACITY: usize = 100;

// =============================================================================
// Sync Status
// =============================================================================

/// Snapshot of the engine for the field app.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub network_status: NetworkStatus,

    pub emergency_override: bool,

    /// Records waiting for the next pass.
    pub pending_count: u64,

    /// Failed records; those with budget left rejoin the next pass.
    pub failed_count: u64,

    pub in_progress: bool,

    /// End of the last pass that synced every record it touched.
    pub last_sync: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    pub last_session_id: Option<String>,

    pub auto_sync: bool,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives engine events (implemented by the field app integration).
pub trait SyncEventEmitter: Send + Sync {
    /// Emits a status change.
    fn emit_status(&self, status: &SyncStatus);

    /// Emits batch progress within a pass.
    fn emit_progress(&self, processed: u64, total: u64);

    /// Emits a failed or aborted pass.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// Emitter that drops every event.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_progress(&self, _processed: u64, _total: u64) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Engine State
// =============================================================================

#[derive(Debug, Default)]
struct EngineState {
    network_status: NetworkStatus,
    emergency_override: bool,
    last_attempt_at: Option<DateTime<Utc>>,
    last_sync: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_session_id: Option<String>,
    recent_errors: VecDeque<String>,
}

impl EngineState {
    fn note_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.recent_errors.len() == RECENT_ERRORS_CAPACITY {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(message.clone());
        self.last_error = Some(message);
    }
}

/// Clears the in-progress flag on every exit path.
struct PassGuard(Arc<AtomicBool>);

impl PassGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard(Arc::clone(flag)))
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Sync Orchestrator
// =============================================================================

/// Runs sync passes for one agent's queue on one device.
///
/// Cheap to clone; clones share the queue, the state and the in-progress
/// guard.
#[derive(Clone)]
pub struct SyncOrchestrator {
    config: Arc<SyncConfig>,
    store: QueueStore,
    sessions: SessionTracker,
    processor: BatchProcessor,
    scheduler: Arc<dyn Scheduler>,
    emitter: Arc<dyn SyncEventEmitter>,
    state: Arc<RwLock<EngineState>>,
    in_progress: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator delivering into the SQLite sink of `db`.
    pub fn new(config: SyncConfig, db: Arc<Database>) -> Result<Self> {
        SyncOrchestratorBuilder::new(config).with_database(db).build()
    }

    pub fn builder(config: SyncConfig) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The queue this orchestrator drains.
    pub fn queue(&self) -> &QueueStore {
        &self.store
    }

    // =========================================================================
    // Caller-facing queue operations
    // =========================================================================

    /// Queues a record and wakes the auto-sync loop.
    pub async fn enqueue(
        &self,
        record_type: &str,
        payload: Payload,
        subject_id: Option<i64>,
        metadata: Option<Payload>,
    ) -> Result<QueueRecord> {
        let record = self
            .store
            .enqueue(record_type, payload, subject_id, metadata)
            .await?;
        self.wake.notify_one();
        Ok(record)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.store.stats().await
    }

    pub async fn purge_synced(&self) -> Result<u64> {
        let deleted = self.store.purge_synced().await?;
        info!(deleted, "Purged synced records");
        Ok(deleted)
    }

    pub async fn purge_failed(&self) -> Result<u64> {
        let deleted = self.store.purge_failed().await?;
        info!(deleted, "Purged failed records");
        Ok(deleted)
    }

    pub async fn purge_all(&self) -> Result<u64> {
        self.store.purge_all().await
    }

    // =========================================================================
    // Sync passes
    // =========================================================================

    /// Runs one pass over the pending records and the failed records that
    /// still have attempt budget, subject to the gates.
    ///
    /// `force` skips the empty-queue and cooldown gates; it never skips the
    /// offline gate.
    pub async fn attempt_sync(&self, force: bool) -> SyncResult {
        let (pending, failed) = match self.counts().await {
            Ok(counts) => counts,
            Err(e) => {
                error!(error = %e, "Failed to read queue counts");
                let message = e.to_string();
                self.state.write().await.note_error(message.clone());
                return SyncResult::aborted(message, 0, None);
            }
        };

        if pending == 0 && failed == 0 && !force {
            debug!("Queue empty, nothing to sync");
            return SyncResult::empty();
        }

        let now = self.scheduler.now();
        {
            let state = self.state.read().await;

            if state.network_status.is_offline() && !state.emergency_override {
                return self.gated(GateReason::NetworkOffline, pending);
            }

            let cooldown = to_chrono(self.config.sync.cooldown());
            let cooling = state.last_attempt_at.is_some_and(|last| now - last < cooldown);
            if cooling && !force {
                return self.gated(GateReason::RateLimited, pending);
            }
        }

        let Some(_guard) = PassGuard::acquire(&self.in_progress) else {
            return self.gated(GateReason::InProgress, pending);
        };

        self.state.write().await.last_attempt_at = Some(now);
        let result = self.run_pass(now).await;

        self.finish_pass(&result).await;
        result
    }

    /// Re-queues failed records that still have retry budget, then runs a
    /// forced pass.
    pub async fn retry_failed(&self) -> SyncResult {
        match self.store.requeue_failed(self.config.sync.max_retries).await {
            Ok(RequeueSummary { requeued, exhausted }) => {
                info!(requeued, exhausted, "Retrying failed records");
            }
            Err(e) => {
                error!(error = %e, "Failed to requeue failed records");
                let message = e.to_string();
                self.state.write().await.note_error(message.clone());
                let pending = self.store.count(RecordStatus::Pending).await.unwrap_or(0);
                return SyncResult::aborted(message, pending, None);
            }
        }
        self.attempt_sync(true).await
    }

    fn gated(&self, reason: GateReason, pending: u64) -> SyncResult {
        let err = SyncError::Gated(reason);
        warn!(error = %err, retryable = err.is_retryable(), pending, "Sync pass gated");
        SyncResult::gated(reason, pending)
    }

    async fn run_pass(&self, started: DateTime<Utc>) -> SyncResult {
        let network_status = self.state.read().await.network_status;
        let mut session = self.open_session(network_status, started).await;
        let session_id = session.as_ref().map(|s| s.session_id.clone());

        info!(session_id = ?session_id, %network_status, "Sync pass started");

        let deadline = started + to_chrono(self.config.sync.sync_timeout());
        let outcome = AssertUnwindSafe(self.deliver_queue(deadline))
            .catch_unwind()
            .await;

        let mut result = match outcome {
            Ok(Ok(report)) => self.summarize(report, session_id.clone()),
            Ok(Err(e)) => {
                error!(error = %e, "Sync pass aborted");
                SyncResult::aborted(e.to_string(), 0, session_id.clone())
            }
            Err(panic) => {
                let err = SyncError::Panicked(panic_message(panic.as_ref()));
                error!(error = %err, "Sync pass aborted");
                SyncResult::aborted(err.to_string(), 0, session_id.clone())
            }
        };

        result.pending = self.store.count(RecordStatus::Pending).await.unwrap_or(0);

        if let Some(session) = session.as_mut() {
            let results = SessionResults {
                synced: result.synced,
                failed: result.failed,
                errors: result.errors.clone(),
            };
            let at = self.scheduler.now();
            if let Err(e) = self.sessions.complete_session(session, &results, at).await {
                error!(session_id = %session.session_id, error = %e, "Failed to complete session");
                self.state.write().await.note_error(e.to_string());
            }
        }

        info!(
            success = result.success,
            synced = result.synced,
            failed = result.failed,
            pending = result.pending,
            "Sync pass finished"
        );
        result
    }

    async fn open_session(
        &self,
        network_status: NetworkStatus,
        at: DateTime<Utc>,
    ) -> Option<SyncSession> {
        match self
            .sessions
            .start_session(
                self.store.agent_id(),
                self.store.device_id(),
                network_status,
                at,
            )
            .await
        {
            Ok(session) => Some(session),
            Err(e) => {
                error!(error = %e, "Failed to start session, delivering without one");
                self.state.write().await.note_error(e.to_string());
                None
            }
        }
    }

    /// Delivers pending records plus failed records that still have budget.
    async fn deliver_queue(&self, deadline: DateTime<Utc>) -> Result<BatchReport> {
        let settings = &self.config.sync;
        let reopened = self
            .store
            .reopen_for_pass(settings.max_retries, settings.checksum_validation)
            .await?;
        if reopened.requeued > 0 {
            debug!(requeued = reopened.requeued, "Failed records rejoin the pass");
        }

        let records = self.store.list_pending().await?;
        let emitter = Arc::clone(&self.emitter);
        let report = self
            .processor
            .run(records, Some(deadline), move |progress| {
                emitter.emit_progress(progress.processed, progress.total)
            })
            .await;
        Ok(report)
    }

    fn summarize(&self, report: BatchReport, session_id: Option<String>) -> SyncResult {
        let mut errors = report.errors;
        if report.timed_out {
            errors.push(SyncError::Timeout(self.config.sync.sync_timeout_secs).to_string());
        }

        SyncResult {
            success: report.failed == 0 && report.unsettled == 0 && !report.timed_out,
            synced: report.synced,
            failed: report.failed,
            pending: 0,
            errors,
            session_id,
            gate: None,
        }
    }

    async fn finish_pass(&self, result: &SyncResult) {
        {
            let mut state = self.state.write().await;
            if result.session_id.is_some() {
                state.last_session_id = result.session_id.clone();
            }
            if result.success {
                state.last_sync = Some(self.scheduler.now());
            }
            for message in &result.errors {
                state.note_error(message.clone());
            }
        }

        if !result.success {
            let message = result
                .errors
                .last()
                .map(String::as_str)
                .unwrap_or("sync pass failed");
            self.emitter.emit_error(message, result.pending > 0);
        }

        let status = self.status().await;
        self.emitter.emit_status(&status);
    }

    // =========================================================================
    // Status and settings
    // =========================================================================

    /// Current engine snapshot. Counts fall back to zero if storage fails.
    pub async fn status(&self) -> SyncStatus {
        let (pending_count, failed_count) = self.counts().await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read queue counts for status");
            (0, 0)
        });
        let state = self.state.read().await;

        SyncStatus {
            network_status: state.network_status,
            emergency_override: state.emergency_override,
            pending_count,
            failed_count,
            in_progress: self.in_progress.load(Ordering::Acquire),
            last_sync: state.last_sync,
            last_error: state.last_error.clone(),
            last_session_id: state.last_session_id.clone(),
            auto_sync: self.config.sync.auto_sync,
        }
    }

    /// Records the device's connectivity. Leaving `offline` wakes the
    /// auto-sync loop.
    pub async fn set_network_status(&self, network_status: NetworkStatus) {
        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut state.network_status, network_status)
        };

        if previous != network_status {
            info!(from = %previous, to = %network_status, "Network status changed");
            if previous.is_offline() {
                self.wake.notify_one();
            }
            let status = self.status().await;
            self.emitter.emit_status(&status);
        }
    }

    /// Lets passes run while offline.
    pub async fn set_emergency_override(&self, enabled: bool) {
        self.state.write().await.emergency_override = enabled;
        if enabled {
            warn!("Emergency override enabled, offline gate bypassed");
            self.wake.notify_one();
        } else {
            info!("Emergency override disabled");
        }
    }

    /// Last `limit` pass-level errors, newest first.
    pub async fn recent_errors(&self, limit: usize) -> Vec<String> {
        self.state
            .read()
            .await
            .recent_errors
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Sessions of this agent started in the last `days` days, newest first.
    pub async fn sync_history(&self, days: u32) -> Result<Vec<SyncSession>> {
        let since = self.scheduler.now() - chrono::Duration::days(i64::from(days));
        self.sessions.history(self.store.agent_id(), since).await
    }

    async fn counts(&self) -> Result<(u64, u64)> {
        let pending = self.store.count(RecordStatus::Pending).await?;
        let failed = self.store.count(RecordStatus::Failed).await?;
        Ok((pending, failed))
    }

    // =========================================================================
    // Auto-sync
    // =========================================================================

    /// Spawns the background loop, or returns `None` when auto-sync is
    /// disabled. Must be called inside a tokio runtime.
    pub fn spawn_auto_sync(&self) -> Option<AutoSyncHandle> {
        if !self.config.sync.auto_sync {
            info!("Auto-sync disabled");
            return None;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let orchestrator = self.clone();
        let task = tokio::spawn(async move { orchestrator.auto_sync_loop(shutdown_rx).await });

        Some(AutoSyncHandle { shutdown_tx, task })
    }

    async fn auto_sync_loop(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let interval = self.config.sync.auto_sync_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), "Auto-sync started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Auto-sync received shutdown");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            {
                let state = self.state.read().await;
                if state.network_status.is_offline() && !state.emergency_override {
                    continue;
                }
            }

            match self.store.count(RecordStatus::Pending).await {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Auto-sync could not read the queue");
                    continue;
                }
            }

            let result = self.attempt_sync(false).await;
            debug!(
                success = result.success,
                synced = result.synced,
                gate = ?result.gate,
                "Auto-sync pass"
            );
        }

        info!("Auto-sync stopped");
    }
}

/// Handle to a running auto-sync loop.
pub struct AutoSyncHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl AutoSyncHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the loop after its current pass and waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Auto-sync task ended abnormally");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`SyncOrchestrator`] with replaceable collaborators.
pub struct SyncOrchestratorBuilder {
    config: SyncConfig,
    db: Option<Arc<Database>>,
    sink: Option<Arc<dyn DataSink>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
}

impl SyncOrchestratorBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncOrchestratorBuilder {
            config,
            db: None,
            sink: None,
            scheduler: None,
            emitter: None,
        }
    }

    /// Sets the database holding the queue and session tables.
    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    /// Replaces the default SQLite sink.
    pub fn with_sink(mut self, sink: Arc<dyn DataSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Validates the config and builds the orchestrator.
    pub fn build(self) -> Result<SyncOrchestrator> {
        self.config.validate()?;

        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(SqliteSink::new(&db)));
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(TokioScheduler));
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        let store = QueueStore::new(&db, self.config.agent_id(), self.config.device_id());
        let processor = BatchProcessor::new(
            store.clone(),
            TypeRouter::new(sink),
            Arc::clone(&scheduler),
            &self.config.sync,
        );

        Ok(SyncOrchestrator {
            sessions: SessionTracker::new(&db),
            config: Arc::new(self.config),
            store,
            processor,
            scheduler,
            emitter,
            state: Arc::new(RwLock::new(EngineState::default())),
            in_progress: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        })
    }
}
