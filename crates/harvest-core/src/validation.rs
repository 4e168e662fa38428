//! # Validation Module
//!
//! Input validation for the offline queue.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Collection form                                              │
//! │  ├── Required fields, widget-level formats                             │
//! │  └── Immediate feedback to the field agent                             │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: enqueue() (Rust)                                             │
//! │  ├── Identifiers, record tag, payload size                             │
//! │  └── THIS MODULE                                                       │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: delivery (typed payload parse)                               │
//! │  ├── Shape per record type, coordinate and percentage ranges           │
//! │  └── Failures here are permanent data errors, never retried            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use harvest_core::validation::{validate_identifier, validate_record_tag};
//!
//! validate_identifier("agent_id", "agent-7").unwrap();
//! validate_record_tag("household").unwrap();
//! ```

use crate::checksum::canonical_payload;
use crate::error::ValidationError;
use crate::types::Payload;
use crate::{MAX_IDENTIFIER_LEN, MAX_PAYLOAD_BYTES, MAX_RECORD_TYPE_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates an agent or device identifier.
///
/// ## Rules
/// - Must not be empty
/// - At most [`MAX_IDENTIFIER_LEN`] characters
/// - No whitespace or control characters
///
/// ## Example
/// ```rust
/// use harvest_core::validation::validate_identifier;
///
/// assert!(validate_identifier("device_id", "tablet-3").is_ok());
/// assert!(validate_identifier("device_id", "").is_err());
/// assert!(validate_identifier("device_id", "tab let").is_err());
/// ```
pub fn validate_identifier(field: &str, value: &str) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_IDENTIFIER_LEN,
        });
    }

    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must not contain whitespace".to_string(),
        });
    }

    Ok(())
}

/// Validates a record type tag as supplied by the caller.
///
/// Unknown tags are fine (they route to the generic handler); the tag only
/// has to be a usable storage key.
///
/// ## Rules
/// - Must not be empty
/// - At most [`MAX_RECORD_TYPE_LEN`] characters
/// - Letters, digits, underscores, hyphens and dots only
pub fn validate_record_tag(tag: &str) -> ValidationResult<()> {
    let tag = tag.trim();

    if tag.is_empty() {
        return Err(ValidationError::Required {
            field: "record_type".to_string(),
        });
    }

    if tag.len() > MAX_RECORD_TYPE_LEN {
        return Err(ValidationError::TooLong {
            field: "record_type".to_string(),
            max: MAX_RECORD_TYPE_LEN,
        });
    }

    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(ValidationError::InvalidFormat {
            field: "record_type".to_string(),
            reason: "must contain only letters, numbers, underscores, hyphens, and dots"
                .to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Payload Validators
// =============================================================================

/// Validates the size of a payload's canonical form.
pub fn validate_payload_size(payload: &Payload) -> ValidationResult<()> {
    if canonical_payload(payload).len() > MAX_PAYLOAD_BYTES {
        return Err(ValidationError::TooLong {
            field: "payload".to_string(),
            max: MAX_PAYLOAD_BYTES,
        });
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a WGS84 coordinate pair.
pub fn validate_coordinates(latitude: f64, longitude: f64) -> ValidationResult<()> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(ValidationError::OutOfRange {
            field: "latitude".to_string(),
            min: -90,
            max: 90,
        });
    }

    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(ValidationError::OutOfRange {
            field: "longitude".to_string(),
            min: -180,
            max: 180,
        });
    }

    Ok(())
}

/// Validates a completion percentage (0 to 100 inclusive).
pub fn validate_percentage(field: &str, value: i64) -> ValidationResult<()> {
    if !(0..=100).contains(&value) {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 0,
            max: 100,
        });
    }

    Ok(())
}

/// Validates a count that may be zero but not negative.
pub fn validate_count(field: &str, value: i64) -> ValidationResult<()> {
    if value < 0 {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    Ok(())
}

// =============================================================================
// UUID Validators
// =============================================================================

/// Validates a UUID string format.
///
/// ## Example
/// ```rust
/// use harvest_core::validation::validate_uuid;
///
/// assert!(validate_uuid("550e8400-e29b-41d4-a716-446655440000").is_ok());
/// assert!(validate_uuid("not-a-uuid").is_err());
/// ```
pub fn validate_uuid(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "id".to_string(),
        });
    }

    uuid::Uuid::parse_str(id).map_err(|_| ValidationError::InvalidFormat {
        field: "id".to_string(),
        reason: "must be a valid UUID".to_string(),
    })?;

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("agent_id", "agent-7").is_ok());
        assert!(validate_identifier("agent_id", "AGT_0001").is_ok());

        assert!(validate_identifier("agent_id", "").is_err());
        assert!(validate_identifier("agent_id", "   ").is_err());
        assert!(validate_identifier("agent_id", "has space").is_err());
        assert!(validate_identifier("agent_id", &"a".repeat(200)).is_err());
    }

    #[test]
    fn test_validate_record_tag() {
        assert!(validate_record_tag("household").is_ok());
        assert!(validate_record_tag("crop_yield.v2").is_ok());

        assert!(validate_record_tag("").is_err());
        assert!(validate_record_tag("drop table;").is_err());
        assert!(validate_record_tag(&"t".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_payload_size() {
        let mut payload = Payload::new();
        payload.insert("note".into(), "short".into());
        assert!(validate_payload_size(&payload).is_ok());

        payload.insert("blob".into(), "x".repeat(MAX_PAYLOAD_BYTES).into());
        assert!(validate_payload_size(&payload).is_err());
    }

    #[test]
    fn test_validate_coordinates() {
        assert!(validate_coordinates(25.03, -77.39).is_ok());
        assert!(validate_coordinates(-90.0, 180.0).is_ok());

        assert!(validate_coordinates(90.5, 0.0).is_err());
        assert!(validate_coordinates(0.0, -181.0).is_err());
        assert!(validate_coordinates(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_validate_percentage() {
        assert!(validate_percentage("completion_percentage", 0).is_ok());
        assert!(validate_percentage("completion_percentage", 100).is_ok());
        assert!(validate_percentage("completion_percentage", 101).is_err());
        assert!(validate_percentage("completion_percentage", -1).is_err());
    }

    #[test]
    fn test_validate_uuid() {
        assert!(validate_uuid("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_uuid("").is_err());
        assert!(validate_uuid("not-a-uuid").is_err());
    }
}
