//! # harvest-core: Pure Domain Logic for the Harvest Sync Engine
//!
//! This crate holds the record model of the offline queue as pure functions
//! and types with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Harvest Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Field App (collection forms)                    │   │
//! │  │      enqueue() ──► attempt_sync() ──► queue_stats()            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 harvest-sync (engine)                           │   │
//! │  │    orchestrator, batches, retry, router, sessions               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ harvest-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ checksum  │  │  payload  │  │ validation│  │   │
//! │  │   │QueueRecord│  │  SHA-256  │  │  typed    │  │   rules   │  │   │
//! │  │   │SyncSession│  │ canonical │  │  shapes   │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • NO TIMERS                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 harvest-db (Database Layer)                     │   │
//! │  │        queue table, session table, field-data tables            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Queue records, sessions, stats, sync results
//! - [`checksum`] - Canonical payload hashing
//! - [`payload`] - Typed payload shape per record type
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use harvest_core::{QueueRecord, RecordType, Payload};
//!
//! let mut payload = Payload::new();
//! payload.insert("lat".into(), 25.03.into());
//! payload.insert("lon".into(), (-77.39).into());
//!
//! let record = QueueRecord::new("agent-7", "tablet-3", RecordType::Location, payload, Some(42), None);
//! assert!(record.verify_checksum());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod checksum;
pub mod error;
pub mod payload;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use checksum::compute_checksum;
pub use error::{CoreError, CoreResult, ValidationError};
pub use payload::RecordPayload;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum length of a record type tag.
pub const MAX_RECORD_TYPE_LEN: usize = 64;

/// Maximum length of agent and device identifiers.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Maximum size of a canonical payload, in bytes.
///
/// Field forms are small; anything larger is almost certainly an attachment
/// that belongs in a separate upload path.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
