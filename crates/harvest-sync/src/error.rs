//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │    Gating       │  │     Delivery            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Gated(offline) │  │  IntegrityCheckFailed   │ │
//! │  │  MissingAgentId │  │  Gated(rate)    │  │  Timeout                │ │
//! │  │  ConfigLoad/Save│  │  Gated(running) │  │  Data(DataError)        │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Storage      │  │    Session      │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  DatabaseError  │  │  SessionFailed  │  │  Panicked               │ │
//! │  │  RecordState    │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`DataError`] is the narrower error a [`DataSink`](crate::sink::DataSink)
//! returns for one record; the batch processor folds it into the pass
//! result instead of propagating it.

use harvest_core::{CoreError, GateReason, ValidationError};
use harvest_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Sync error type covering all engine-level failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID.
    #[error("Device ID not configured")]
    MissingDeviceId,

    /// Missing agent ID (every record is attributed to an agent).
    #[error("Agent ID not configured. Sign in on the device first.")]
    MissingAgentId,

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Gating Errors
    // =========================================================================
    /// A gate refused the pass before any record was touched.
    #[error("{0}")]
    Gated(GateReason),

    // =========================================================================
    // Delivery Errors
    // =========================================================================
    /// Payload no longer matches the checksum computed at enqueue.
    #[error("integrity check failed")]
    IntegrityCheckFailed { record_id: String },

    /// The pass deadline passed before every record was delivered.
    #[error("sync timeout after {0} seconds")]
    Timeout(u64),

    /// Enqueue input rejected.
    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] ValidationError),

    /// Sink or handler failure for a single record.
    #[error(transparent)]
    Data(#[from] DataError),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Queue or session storage failed.
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbError),

    /// Illegal record state change.
    #[error(transparent)]
    RecordState(#[from] CoreError),

    /// Failed to serialize a value.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Session row could not be written.
    #[error("Session error: {0}")]
    SessionFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// A sync pass panicked and was contained.
    #[error("Sync pass panicked: {0}")]
    Panicked(String),
}

// =============================================================================
// Data Error
// =============================================================================

/// Failure of one record's reconciliation.
#[derive(Debug, Error)]
pub enum DataError {
    /// Payload does not have the shape its record type requires.
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] ValidationError),

    /// Record concerns an existing subject but none could be resolved.
    #[error("No subject_id for {record_type} record")]
    MissingSubject { record_type: String },

    /// Referenced entity does not exist in the sink.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// The sink itself failed.
    #[error("Sink error: {0}")]
    Sink(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for DataError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => DataError::NotFound { entity, id },
            other => DataError::Sink(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for DataError {
    fn from(err: sqlx::Error) -> Self {
        DataError::from(DbError::from(err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl DataError {
    /// Returns true if calling the sink again may succeed.
    ///
    /// Payload shape and unresolved subjects are permanent; the record is
    /// failed without backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DataError::Sink(_) | DataError::NotFound { .. })
    }
}

impl SyncError {
    /// Returns true if the operation can be retried later.
    ///
    /// ## Retryable Errors
    /// - Transient sink or database failures
    /// - Timeouts
    /// - Rate limiting and a pass already running
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Integrity failures (data is suspect)
    /// - Invalid payloads
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Timeout(_) => true,
            SyncError::DatabaseError(db) => db.is_transient(),
            SyncError::Data(data) => data.is_retryable(),
            SyncError::Gated(reason) => !matches!(reason, GateReason::NetworkOffline),
            _ => false,
        }
    }

    /// Returns true if this is a gating refusal rather than a failure.
    pub fn is_gating(&self) -> bool {
        matches!(self, SyncError::Gated(_))
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::MissingAgentId
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gating_messages() {
        assert_eq!(
            SyncError::Gated(GateReason::NetworkOffline).to_string(),
            "network offline"
        );
        assert_eq!(
            SyncError::Gated(GateReason::RateLimited).to_string(),
            "rate limited"
        );
        assert!(SyncError::Gated(GateReason::RateLimited).is_gating());
    }

    #[test]
    fn test_integrity_and_timeout_messages() {
        let err = SyncError::IntegrityCheckFailed {
            record_id: "r-1".into(),
        };
        assert_eq!(err.to_string(), "integrity check failed");
        assert!(!err.is_retryable());

        assert_eq!(SyncError::Timeout(30).to_string(), "sync timeout after 30 seconds");
        assert!(SyncError::Timeout(30).is_retryable());
    }

    #[test]
    fn test_error_categorization() {
        assert!(SyncError::MissingAgentId.is_config_error());
        assert!(SyncError::InvalidConfig("x".into()).is_config_error());
        assert!(!SyncError::Gated(GateReason::NetworkOffline).is_retryable());
        assert!(SyncError::Gated(GateReason::InProgress).is_retryable());
    }

    #[test]
    fn test_data_error_retryability() {
        assert!(DataError::Sink("locked".into()).is_retryable());
        assert!(!DataError::MissingSubject {
            record_type: "household".into()
        }
        .is_retryable());

        let invalid = DataError::from(ValidationError::Required {
            field: "assignment_id".into(),
        });
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn test_db_not_found_maps_to_data_not_found() {
        let err = DataError::from(DbError::not_found("Subject", "42"));
        assert!(matches!(err, DataError::NotFound { ref entity, .. } if entity == "Subject"));
        assert_eq!(err.to_string(), "Subject not found: 42");
    }
}
