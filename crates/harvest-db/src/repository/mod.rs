//! # Repository Module
//!
//! Database repository implementations for the offline queue.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repositories and Their Callers                       │
//! │                                                                         │
//! │  QueueStore (harvest-sync)                                             │
//! │       │  db.queue().list_by_status("agent-7", Pending)                 │
//! │       ▼                                                                 │
//! │  QueueRepository      offline_queue                                    │
//! │                                                                         │
//! │  SessionTracker (harvest-sync)                                         │
//! │       │  db.sessions().complete(&session)                              │
//! │       ▼                                                                 │
//! │  SessionRepository    sync_sessions                                    │
//! │                                                                         │
//! │  SqliteSink (harvest-sync)                                             │
//! │       │  db.field_data().upsert_household(42, &household)              │
//! │       ▼                                                                 │
//! │  FieldDataRepository  subjects, households, labour_entries, ...        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`QueueRepository`](queue::QueueRepository) - Queue record persistence
//! - [`SessionRepository`](session::SessionRepository) - Sync session audit
//! - [`FieldDataRepository`](field_data::FieldDataRepository) - Reconciliation writes

pub mod field_data;
pub mod queue;
pub mod session;
