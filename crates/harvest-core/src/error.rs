//! # Error Types
//!
//! Domain-specific error types for harvest-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  harvest-core errors (this file)                                       │
//! │  ├── CoreError        - Record lifecycle violations                    │
//! │  └── ValidationError  - Enqueue / payload input failures               │
//! │                                                                         │
//! │  harvest-db errors (separate crate)                                    │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  harvest-sync errors (separate crate)                                  │
//! │  ├── DataError        - Sink/handler failures for one record           │
//! │  └── SyncError        - Gating, integrity, session, config failures    │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → SyncResult.errors     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::types::RecordStatus;

// =============================================================================
// Core Error
// =============================================================================

/// Record lifecycle errors.
///
/// The queue state machine is small (`pending → synced | failed`,
/// `failed → pending`), and every illegal move is reported here instead of
/// being silently ignored.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Requested status change is not an edge of the record state machine.
    ///
    /// ## When This Occurs
    /// - Marking a synced record as failed
    /// - Re-queueing a record that is still pending
    /// - Any transition out of `synced`
    #[error("Record {record_id} cannot move from {from} to {to}")]
    InvalidTransition {
        record_id: String,
        from: RecordStatus,
        to: RecordStatus,
    },

    /// A failed record has used its lifetime attempt budget.
    #[error("Record {record_id} exhausted its retry budget ({attempts} attempts)")]
    RetryBudgetExhausted { record_id: String, attempts: i64 },

    /// Sync session was already finalized.
    #[error("Session {session_id} is already completed")]
    SessionClosed { session_id: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before anything reaches the queue, and when a payload does not
/// match the shape its record type declares.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., invalid UUID, unparseable payload).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
