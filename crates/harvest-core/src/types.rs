//! # Domain Types
//!
//! Core data structures for the offline queue and its sync sessions.
//!
//! ## Record Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        QueueRecord States                               │
//! │                                                                         │
//! │   enqueue()                                                             │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  ┌─────────┐   handler ok    ┌─────────┐                               │
//! │  │ PENDING │ ──────────────► │ SYNCED  │  terminal, removed by purge   │
//! │  └─────────┘                 └─────────┘                               │
//! │      │  ▲                                                               │
//! │      │  │ retry_failed() (only while attempts < max_retries)           │
//! │      ▼  │                                                               │
//! │  ┌─────────┐                                                            │
//! │  │ FAILED  │  integrity failure, retries exhausted, permanent error    │
//! │  └─────────┘                                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! - `record_id`: UUID v4, assigned at enqueue, immutable
//! - `subject_id`: central-store id of the surveyed entity, may be assigned
//!   later by the handler that creates the entity

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::checksum;
use crate::error::{CoreError, CoreResult, ValidationError};

/// Opaque structured field data carried by a record.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Metadata key selecting the record priority.
pub const METADATA_PRIORITY: &str = "priority";

/// Metadata key linking a record to the entity-creating record it depends on.
pub const METADATA_SUBJECT_REF: &str = "subject_ref";

// =============================================================================
// Record Type
// =============================================================================

/// The kind of field data a record carries.
///
/// Selects the reconciliation handler. Tags that are not recognised are kept
/// verbatim in [`RecordType::Generic`] and stored uninterpreted, so schema
/// drift on a device never turns into data loss.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum RecordType {
    /// Profile of the surveyed subject (creates the subject when new).
    SubjectProfile,
    /// Household composition and income sources.
    Household,
    /// Labour entries of the holding.
    Labour,
    /// Machinery and other assets.
    AssetInventory,
    /// Land use parcels.
    LandUse,
    /// Status change of an agent assignment.
    AssignmentStatus,
    /// GPS position of the subject.
    Location,
    /// Newly scheduled interview.
    InterviewSetup,
    /// Survey completion progress.
    Progress,
    /// Anything else, stored raw. Holds the declared tag.
    Generic(String),
}

impl RecordType {
    /// All routable tags, in routing-table order.
    pub const KNOWN_TAGS: [&'static str; 9] = [
        "subject_profile",
        "household",
        "labour",
        "asset_inventory",
        "land_use",
        "assignment_status",
        "location",
        "interview_setup",
        "progress",
    ];

    /// Parses a tag, accepting the legacy section names used by older
    /// collection forms.
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "subject_profile" | "holder_information" | "holder_info" => RecordType::SubjectProfile,
            "household" | "household_information" => RecordType::Household,
            "labour" | "labor" | "labour_information" => RecordType::Labour,
            "asset_inventory" | "machinery_information" => RecordType::AssetInventory,
            "land_use" | "land_use_information" => RecordType::LandUse,
            "assignment_status" | "assignment_update" => RecordType::AssignmentStatus,
            "location" | "location_update" => RecordType::Location,
            "interview_setup" => RecordType::InterviewSetup,
            "progress" | "survey_progress" => RecordType::Progress,
            _ => RecordType::Generic(tag.trim().to_string()),
        }
    }

    /// Returns the canonical tag.
    pub fn as_str(&self) -> &str {
        match self {
            RecordType::SubjectProfile => "subject_profile",
            RecordType::Household => "household",
            RecordType::Labour => "labour",
            RecordType::AssetInventory => "asset_inventory",
            RecordType::LandUse => "land_use",
            RecordType::AssignmentStatus => "assignment_status",
            RecordType::Location => "location",
            RecordType::InterviewSetup => "interview_setup",
            RecordType::Progress => "progress",
            RecordType::Generic(tag) => tag,
        }
    }

    /// Returns true if the record can only be applied to a known subject.
    pub fn requires_subject(&self) -> bool {
        matches!(
            self,
            RecordType::Household
                | RecordType::Labour
                | RecordType::AssetInventory
                | RecordType::LandUse
                | RecordType::Location
        )
    }

    /// Returns true if delivering this record may create a new subject.
    pub fn creates_subject(&self) -> bool {
        matches!(self, RecordType::SubjectProfile)
    }

    /// Returns true if the tag falls through to the generic handler.
    pub fn is_generic(&self) -> bool {
        matches!(self, RecordType::Generic(_))
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RecordType::parse(s))
    }
}

impl From<String> for RecordType {
    fn from(tag: String) -> Self {
        RecordType::parse(&tag)
    }
}

impl From<RecordType> for String {
    fn from(record_type: RecordType) -> Self {
        record_type.as_str().to_string()
    }
}

// =============================================================================
// Record Status
// =============================================================================

/// Delivery state of a queued record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Waiting for delivery.
    Pending,
    /// Delivery gave up; waits for an explicit retry.
    Failed,
    /// Applied to the central store. Terminal.
    Synced,
}

impl RecordStatus {
    /// Returns the lowercase name stored in the queue table.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Failed => "failed",
            RecordStatus::Synced => "synced",
        }
    }

    /// Returns true if the record still belongs to the active queue.
    pub fn is_active(&self) -> bool {
        !matches!(self, RecordStatus::Synced)
    }
}

impl Default for RecordStatus {
    fn default() -> Self {
        RecordStatus::Pending
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(RecordStatus::Pending),
            "failed" => Ok(RecordStatus::Failed),
            "synced" => Ok(RecordStatus::Synced),
            _ => Err(ValidationError::NotAllowed {
                field: "status".to_string(),
                allowed: vec!["pending".into(), "failed".into(), "synced".into()],
            }),
        }
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Delivery priority. Only affects ordering, never whether a record is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Sort rank: high (0) < normal (1) < low (2).
    #[inline]
    pub const fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(ValidationError::NotAllowed {
                field: "priority".to_string(),
                allowed: vec!["high".into(), "normal".into(), "low".into()],
            }),
        }
    }
}

// =============================================================================
// Queue Record
// =============================================================================

/// A unit of field-collected data awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct QueueRecord {
    /// Unique identifier (UUID v4), assigned at enqueue.
    pub record_id: String,

    /// Field agent who collected the data.
    pub agent_id: String,

    /// Device the data was collected on.
    pub device_id: String,

    /// Central-store id of the subject, if known.
    pub subject_id: Option<i64>,

    /// `record_id` of the record that creates this record's subject.
    pub subject_ref: Option<String>,

    /// Assignment created by delivering this record, if any.
    pub assignment_id: Option<i64>,

    /// Selects the reconciliation handler.
    #[ts(as = "String")]
    pub record_type: RecordType,

    /// The collected field data.
    #[ts(type = "Record<string, unknown>")]
    pub payload: Payload,

    /// Free-form metadata supplied at enqueue (priority, tags, ...).
    #[ts(type = "Record<string, unknown>")]
    pub metadata: Payload,

    /// SHA-256 of the canonical payload, computed at enqueue.
    pub checksum: String,

    pub status: RecordStatus,

    /// Handler invocations so far, across all passes.
    pub attempts: i64,

    pub priority: Priority,

    #[ts(as = "String")]
    pub collected_at: DateTime<Utc>,

    #[ts(as = "Option<String>")]
    pub last_attempt_at: Option<DateTime<Utc>>,

    #[ts(as = "Option<String>")]
    pub synced_at: Option<DateTime<Utc>>,

    /// Last failure reason.
    pub error_message: Option<String>,
}

impl QueueRecord {
    /// Creates a pending record with a fresh id and checksum.
    ///
    /// Priority and subject reference are read from `metadata`; an
    /// unparseable priority falls back to normal.
    pub fn new(
        agent_id: impl Into<String>,
        device_id: impl Into<String>,
        record_type: RecordType,
        payload: Payload,
        subject_id: Option<i64>,
        metadata: Option<Payload>,
    ) -> Self {
        let metadata = metadata.unwrap_or_default();
        let priority = metadata
            .get(METADATA_PRIORITY)
            .and_then(|v| v.as_str())
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();
        let subject_ref = metadata
            .get(METADATA_SUBJECT_REF)
            .and_then(|v| v.as_str())
            .map(str::to_string);

        QueueRecord {
            record_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            device_id: device_id.into(),
            subject_id,
            subject_ref,
            assignment_id: None,
            record_type,
            checksum: checksum::compute_checksum(&payload),
            payload,
            metadata,
            status: RecordStatus::Pending,
            attempts: 0,
            priority,
            collected_at: Utc::now(),
            last_attempt_at: None,
            synced_at: None,
            error_message: None,
        }
    }

    /// Recomputes the payload checksum and compares it to the stored one.
    pub fn verify_checksum(&self) -> bool {
        checksum::verify(self)
    }

    /// Returns true if another handler invocation fits the lifetime budget.
    #[inline]
    pub fn has_retry_budget(&self, max_retries: u32) -> bool {
        self.attempts < i64::from(max_retries)
    }

    /// Counts one handler invocation.
    pub fn record_attempt(&mut self, at: DateTime<Utc>) {
        self.attempts += 1;
        self.last_attempt_at = Some(at);
    }

    /// `pending → synced`.
    pub fn mark_synced(&mut self, at: DateTime<Utc>) -> CoreResult<()> {
        self.transition(RecordStatus::Synced)?;
        self.synced_at = Some(at);
        self.error_message = None;
        Ok(())
    }

    /// `pending → failed`, keeping the reason.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> CoreResult<()> {
        self.transition(RecordStatus::Failed)?;
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// `failed → pending`. Attempts are kept, so the lifetime budget still
    /// applies; the error message is cleared.
    pub fn requeue(&mut self, max_retries: u32) -> CoreResult<()> {
        if self.status == RecordStatus::Failed && !self.has_retry_budget(max_retries) {
            return Err(CoreError::RetryBudgetExhausted {
                record_id: self.record_id.clone(),
                attempts: self.attempts,
            });
        }
        self.transition(RecordStatus::Pending)?;
        self.error_message = None;
        Ok(())
    }

    fn transition(&mut self, to: RecordStatus) -> CoreResult<()> {
        let allowed = matches!(
            (self.status, to),
            (RecordStatus::Pending, RecordStatus::Synced)
                | (RecordStatus::Pending, RecordStatus::Failed)
                | (RecordStatus::Failed, RecordStatus::Pending)
        );

        if !allowed {
            return Err(CoreError::InvalidTransition {
                record_id: self.record_id.clone(),
                from: self.status,
                to,
            });
        }

        self.status = to;
        Ok(())
    }
}

// =============================================================================
// Network Status
// =============================================================================

/// Connectivity as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    #[default]
    Online,
    /// Degraded link; sync still runs.
    Limited,
    Offline,
}

impl NetworkStatus {
    pub fn is_offline(&self) -> bool {
        matches!(self, NetworkStatus::Offline)
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkStatus::Online => write!(f, "online"),
            NetworkStatus::Limited => write!(f, "limited"),
            NetworkStatus::Offline => write!(f, "offline"),
        }
    }
}

impl FromStr for NetworkStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "online" => Ok(NetworkStatus::Online),
            "limited" => Ok(NetworkStatus::Limited),
            "offline" => Ok(NetworkStatus::Offline),
            _ => Err(ValidationError::NotAllowed {
                field: "network_status".to_string(),
                allowed: vec!["online".into(), "limited".into(), "offline".into()],
            }),
        }
    }
}

// =============================================================================
// Sync Session
// =============================================================================

/// Outcome state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Started, not yet finalized.
    InProgress,
    /// Every attempted record synced.
    Completed,
    /// At least one record failed.
    Partial,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::InProgress => write!(f, "in_progress"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Partial => write!(f, "partial"),
        }
    }
}

/// Audit record of one orchestrated sync pass.
///
/// Written once at start and once at completion; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncSession {
    pub session_id: String,
    pub agent_id: String,
    pub device_id: String,
    /// Connectivity when the pass started.
    pub network_status: NetworkStatus,
    #[ts(as = "String")]
    pub started_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub completed_at: Option<DateTime<Utc>>,
    pub records_uploaded: i64,
    pub records_failed: i64,
    pub total_records: i64,
    pub status: SessionStatus,
    pub error_details: Vec<String>,
    pub duration_ms: Option<i64>,
}

impl SyncSession {
    /// Opens a session stamped with the current time.
    pub fn start(
        agent_id: impl Into<String>,
        device_id: impl Into<String>,
        network_status: NetworkStatus,
    ) -> Self {
        SyncSession {
            session_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            device_id: device_id.into(),
            network_status,
            started_at: Utc::now(),
            completed_at: None,
            records_uploaded: 0,
            records_failed: 0,
            total_records: 0,
            status: SessionStatus::InProgress,
            error_details: Vec::new(),
            duration_ms: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Finalizes the session. Fails if it was already finalized.
    pub fn complete(&mut self, results: &SessionResults, at: DateTime<Utc>) -> CoreResult<()> {
        if self.is_completed() {
            return Err(CoreError::SessionClosed {
                session_id: self.session_id.clone(),
            });
        }

        self.completed_at = Some(at);
        self.records_uploaded = results.synced as i64;
        self.records_failed = results.failed as i64;
        self.total_records = results.total() as i64;
        self.status = results.status();
        self.error_details = results.errors.clone();
        self.duration_ms = Some((at - self.started_at).num_milliseconds().max(0));
        Ok(())
    }
}

/// Counts and error detail used to finalize a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionResults {
    pub synced: u64,
    pub failed: u64,
    pub errors: Vec<String>,
}

impl SessionResults {
    pub fn total(&self) -> u64 {
        self.synced + self.failed
    }

    /// Partial when any record failed or the pass reported an error.
    pub fn status(&self) -> SessionStatus {
        if self.failed == 0 && self.errors.is_empty() {
            SessionStatus::Completed
        } else {
            SessionStatus::Partial
        }
    }
}

// =============================================================================
// Queue Statistics
// =============================================================================

/// Per-status counts for one record type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TypeStats {
    pub total: u64,
    pub pending: u64,
    pub failed: u64,
    pub synced: u64,
}

impl TypeStats {
    /// Adds `count` records in `status`.
    pub fn add(&mut self, status: RecordStatus, count: u64) {
        self.total += count;
        match status {
            RecordStatus::Pending => self.pending += count,
            RecordStatus::Failed => self.failed += count,
            RecordStatus::Synced => self.synced += count,
        }
    }
}

/// Snapshot of the queue for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub failed: u64,
    pub synced: u64,
    pub by_type: BTreeMap<String, TypeStats>,
    #[ts(as = "Option<String>")]
    pub oldest_collected_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub newest_collected_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    /// Folds one `(record_type, status, count)` group into the totals.
    pub fn add(&mut self, record_type: &str, status: RecordStatus, count: u64) {
        let mut totals = TypeStats {
            total: self.total,
            pending: self.pending,
            failed: self.failed,
            synced: self.synced,
        };
        totals.add(status, count);
        self.total = totals.total;
        self.pending = totals.pending;
        self.failed = totals.failed;
        self.synced = totals.synced;

        self.by_type
            .entry(record_type.to_string())
            .or_default()
            .add(status, count);
    }

    /// Pending plus failed.
    pub fn active(&self) -> u64 {
        self.pending + self.failed
    }
}

// =============================================================================
// Sync Result
// =============================================================================

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    NetworkOffline,
    RateLimited,
    InProgress,
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateReason::NetworkOffline => write!(f, "network offline"),
            GateReason::RateLimited => write!(f, "rate limited"),
            GateReason::InProgress => write!(f, "sync already in progress"),
        }
    }
}

/// Aggregate outcome returned to the caller of a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncResult {
    /// True when no record failed and the pass was not gated or aborted.
    pub success: bool,
    pub synced: u64,
    pub failed: u64,
    /// Records still pending after the pass.
    pub pending: u64,
    pub errors: Vec<String>,
    pub session_id: Option<String>,
    /// Set when a gate refused the pass.
    pub gate: Option<GateReason>,
}

impl SyncResult {
    /// Successful no-op (nothing queued).
    pub fn empty() -> Self {
        SyncResult {
            success: true,
            ..Default::default()
        }
    }

    /// Pass refused before any record was touched.
    pub fn gated(reason: GateReason, pending: u64) -> Self {
        SyncResult {
            success: false,
            pending,
            errors: vec![reason.to_string()],
            gate: Some(reason),
            ..Default::default()
        }
    }

    /// Pass aborted by an engine-level error.
    pub fn aborted(error: impl Into<String>, pending: u64, session_id: Option<String>) -> Self {
        SyncResult {
            success: false,
            pending,
            errors: vec![error.into()],
            session_id,
            ..Default::default()
        }
    }

    pub fn is_gated(&self) -> bool {
        self.gate.is_some()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("test payload must be an object"),
        }
    }

    fn record() -> QueueRecord {
        QueueRecord::new(
            "agent-7",
            "tablet-3",
            RecordType::Location,
            payload(json!({"lat": 25.03, "lon": -77.39})),
            Some(42),
            None,
        )
    }

    #[test]
    fn test_record_type_aliases() {
        assert_eq!(RecordType::parse("holder_information"), RecordType::SubjectProfile);
        assert_eq!(RecordType::parse("machinery_information"), RecordType::AssetInventory);
        assert_eq!(RecordType::parse("Survey_Progress"), RecordType::Progress);
        assert_eq!(
            RecordType::parse("crop_yield"),
            RecordType::Generic("crop_yield".to_string())
        );
        assert_eq!(RecordType::parse("crop_yield").as_str(), "crop_yield");
    }

    #[test]
    fn test_record_type_serde_is_plain_tag() {
        let json = serde_json::to_string(&RecordType::LandUse).unwrap();
        assert_eq!(json, "\"land_use\"");
        let parsed: RecordType = serde_json::from_str("\"location_update\"").unwrap();
        assert_eq!(parsed, RecordType::Location);
    }

    #[test]
    fn test_new_record_defaults() {
        let rec = record();
        assert_eq!(rec.status, RecordStatus::Pending);
        assert_eq!(rec.attempts, 0);
        assert_eq!(rec.priority, Priority::Normal);
        assert!(rec.verify_checksum());
        assert!(Uuid::parse_str(&rec.record_id).is_ok());
    }

    #[test]
    fn test_priority_and_subject_ref_from_metadata() {
        let rec = QueueRecord::new(
            "agent-7",
            "tablet-3",
            RecordType::Household,
            payload(json!({"household_size": 4})),
            None,
            Some(payload(json!({"priority": "HIGH", "subject_ref": "rec-1"}))),
        );
        assert_eq!(rec.priority, Priority::High);
        assert_eq!(rec.subject_ref.as_deref(), Some("rec-1"));

        let rec = QueueRecord::new(
            "agent-7",
            "tablet-3",
            RecordType::Household,
            Payload::new(),
            None,
            Some(payload(json!({"priority": "urgent"}))),
        );
        assert_eq!(rec.priority, Priority::Normal);
    }

    #[test]
    fn test_priority_rank_order() {
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }

    #[test]
    fn test_state_machine_edges() {
        let mut rec = record();
        rec.mark_failed("sink unavailable").unwrap();
        assert_eq!(rec.status, RecordStatus::Failed);
        assert_eq!(rec.error_message.as_deref(), Some("sink unavailable"));

        rec.requeue(3).unwrap();
        assert_eq!(rec.status, RecordStatus::Pending);
        assert!(rec.error_message.is_none());

        rec.mark_synced(Utc::now()).unwrap();
        assert_eq!(rec.status, RecordStatus::Synced);
        assert!(rec.synced_at.is_some());

        // synced is terminal
        assert!(rec.mark_failed("late").is_err());
        assert!(rec.requeue(3).is_err());
    }

    #[test]
    fn test_requeue_respects_lifetime_budget() {
        let mut rec = record();
        rec.record_attempt(Utc::now());
        rec.record_attempt(Utc::now());
        rec.record_attempt(Utc::now());
        rec.mark_failed("sink unavailable").unwrap();

        let err = rec.requeue(3).unwrap_err();
        assert!(matches!(err, CoreError::RetryBudgetExhausted { attempts: 3, .. }));
        assert_eq!(rec.status, RecordStatus::Failed);
    }

    #[test]
    fn test_session_completes_once() {
        let mut session = SyncSession::start("agent-7", "tablet-3", NetworkStatus::Online);
        let results = SessionResults {
            synced: 4,
            failed: 1,
            errors: vec!["boom".into()],
        };
        session.complete(&results, Utc::now()).unwrap();
        assert_eq!(session.status, SessionStatus::Partial);
        assert_eq!(session.total_records, 5);
        assert!(session.complete(&results, Utc::now()).is_err());
    }

    #[test]
    fn test_queue_stats_fold() {
        let mut stats = QueueStats::default();
        stats.add("location", RecordStatus::Pending, 2);
        stats.add("location", RecordStatus::Synced, 1);
        stats.add("household", RecordStatus::Failed, 3);

        assert_eq!(stats.total, 6);
        assert_eq!(stats.active(), 5);
        assert_eq!(stats.by_type["location"].total, 3);
        assert_eq!(stats.by_type["household"].failed, 3);
    }

    #[test]
    fn test_gated_result_message() {
        let result = SyncResult::gated(GateReason::RateLimited, 2);
        assert!(!result.success);
        assert_eq!(result.errors, vec!["rate limited".to_string()]);
        assert_eq!(result.pending, 2);
    }
}
