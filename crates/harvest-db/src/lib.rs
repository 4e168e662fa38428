//! # harvest-db: Database Layer for the Harvest Sync Engine
//!
//! This crate provides database access for the offline queue. It uses SQLite
//! for local storage with sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Harvest Data Flow                                │
//! │                                                                         │
//! │  harvest-sync (QueueStore, SessionTracker, SqliteSink)                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    harvest-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │   │  (embedded)  │  │   │
//! │  │   │               │    │ QueueRepo      │   │ 001_queue    │  │   │
//! │  │   │ SqlitePool    │◄───│ SessionRepo    │   │ 002_sessions │  │   │
//! │  │   │               │    │ FieldDataRepo  │   │ 003_field    │  │   │
//! │  │   └───────────────┘    └────────────────┘   └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Queue, session and field-data repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use harvest_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/harvest.db")).await?;
//! let pending = db.queue().list_by_status("agent-7", RecordStatus::Pending).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::field_data::FieldDataRepository;
pub use repository::queue::QueueRepository;
pub use repository::session::SessionRepository;
