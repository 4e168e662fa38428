//! # harvest-sync: Offline Queue and Sync Engine
//!
//! This crate buffers field records collected on a device and delivers them
//! to the central data store once connectivity returns.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                SyncOrchestrator (entry point)                    │  │
//! │  │                                                                  │  │
//! │  │  Gating: empty queue, network offline, cooldown, in progress     │  │
//! │  │  One SyncSession per pass; panics contained                      │  │
//! │  │  Optional auto-sync loop (tokio task)                            │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                        BatchProcessor                            │  │
//! │  │                                                                  │  │
//! │  │  Priority + age order, fixed-size batches, pacing, deadline      │  │
//! │  │  Checksum check, RetryPolicy backoff via Scheduler               │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │   QueueStore   │  │   TypeRouter   │  │   SessionTracker       │    │
//! │  │                │  │                │  │                        │    │
//! │  │ offline_queue  │  │ RecordPayload  │  │ sync_sessions          │    │
//! │  │ record leases  │  │ -> DataSink    │  │ write-once audit       │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  STATUS EVENTS (to the field app via SyncEventEmitter):                │
//! │  • status   - SyncStatus after each pass                               │
//! │  • progress - processed/total after each batch                         │
//! │  • error    - failed or aborted passes                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`orchestrator`] - `SyncOrchestrator`, gating, auto-sync, events
//! - [`batch`] - Ordering, batching and per-record delivery
//! - [`router`] - Record type to `DataSink` dispatch
//! - [`sink`] - `DataSink` contract and the SQLite implementation
//! - [`queue`] - `QueueStore` over the offline queue table
//! - [`retry`] - Exponential backoff policy
//! - [`session`] - Sync session audit trail
//! - [`clock`] - `Scheduler` abstraction for time and sleeping
//! - [`config`] - Sync configuration (device, agent, delivery settings)
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harvest_sync::{SyncConfig, SyncOrchestrator};
//! use harvest_db::{Database, DbConfig};
//!
//! let config = SyncConfig::load_or_default(None);
//! let db = Arc::new(Database::new(DbConfig::new("harvest.db")).await?);
//! let engine = SyncOrchestrator::new(config, db)?;
//!
//! engine.enqueue("location", payload, Some(42), None).await?;
//! let result = engine.attempt_sync(false).await;
//! println!("synced {} failed {}", result.synced, result.failed);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod batch;
pub mod clock;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod router;
pub mod session;
pub mod sink;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use batch::{BatchProcessor, BatchProgress, BatchReport, Delivery};
pub use clock::{Scheduler, TokioScheduler, VirtualScheduler};
pub use config::{AgentConfig, DeviceConfig, SyncConfig, SyncSettings};
pub use error::{DataError, Result, SyncError};
pub use orchestrator::{
    AutoSyncHandle, NoOpEmitter, SyncEventEmitter, SyncOrchestrator, SyncOrchestratorBuilder,
    SyncStatus,
};
pub use queue::{QueueStore, RecordLease, RequeueSummary};
pub use retry::{RecordBackoff, RetryPolicy};
pub use router::TypeRouter;
pub use session::SessionTracker;
pub use sink::{DataSink, HandlerOutcome, SqliteSink};

pub use harvest_core::{GateReason, NetworkStatus, QueueStats, SyncResult};
