//! # Typed Payloads
//!
//! Each record type carries its own payload shape. A queued payload stays an
//! opaque map until delivery, where [`RecordPayload::parse`] turns it into
//! the typed variant its handler expects.
//!
//! Asset inventory, land use and generic payloads are stored as whole JSON
//! documents and are not interpreted.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::types::{Payload, RecordType};
use crate::validation::{validate_coordinates, validate_count, validate_percentage, ValidationResult};

/// Profile of the surveyed subject. Absent fields keep stored values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectProfile {
    pub name: Option<String>,
    pub date_of_birth: Option<String>,
    pub gender: Option<String>,
    pub education_level: Option<String>,
    pub marital_status: Option<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    #[serde(alias = "lat")]
    pub latitude: Option<f64>,
    #[serde(alias = "lon")]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Household {
    pub household_size: Option<i64>,
    pub dependents: Option<i64>,
    pub primary_income_source: Option<String>,
    pub secondary_income_source: Option<String>,
    pub housing_type: Option<String>,
}

/// One labour line of a holding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabourEntry {
    pub labour_type: Option<String>,
    pub count: Option<i64>,
    pub description: Option<String>,
}

/// Full replacement set of a subject's labour entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Labour {
    pub labour_entries: Vec<LabourEntry>,
}

/// Status change of an existing assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentUpdate {
    pub assignment_id: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub contact_attempts: Option<i64>,
    #[serde(default)]
    pub last_contact_date: Option<String>,
    /// Appended to the stored notes.
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub completion_percentage: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lon")]
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

/// A newly scheduled interview; creates an assignment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterviewSetup {
    pub interview_type: Option<String>,
    pub scheduled_date: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub assignment_id: i64,
    #[serde(default)]
    pub completion_percentage: i64,
}

/// A payload parsed into the shape of its record type.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPayload {
    SubjectProfile(SubjectProfile),
    Household(Household),
    Labour(Labour),
    AssetInventory(Payload),
    LandUse(Payload),
    AssignmentStatus(AssignmentUpdate),
    Location(Location),
    InterviewSetup(InterviewSetup),
    Progress(ProgressUpdate),
    Generic(Payload),
}

impl RecordPayload {
    /// Parses and range-checks `payload` for `record_type`.
    pub fn parse(record_type: &RecordType, payload: &Payload) -> ValidationResult<Self> {
        let parsed = match record_type {
            RecordType::SubjectProfile => {
                let profile: SubjectProfile = from_payload(payload)?;
                if let (Some(lat), Some(lon)) = (profile.latitude, profile.longitude) {
                    validate_coordinates(lat, lon)?;
                }
                RecordPayload::SubjectProfile(profile)
            }
            RecordType::Household => {
                let household: Household = from_payload(payload)?;
                if let Some(size) = household.household_size {
                    validate_count("household_size", size)?;
                }
                if let Some(dependents) = household.dependents {
                    validate_count("dependents", dependents)?;
                }
                RecordPayload::Household(household)
            }
            RecordType::Labour => {
                let labour: Labour = from_payload(payload)?;
                for entry in &labour.labour_entries {
                    if let Some(count) = entry.count {
                        validate_count("count", count)?;
                    }
                }
                RecordPayload::Labour(labour)
            }
            RecordType::AssetInventory => RecordPayload::AssetInventory(payload.clone()),
            RecordType::LandUse => RecordPayload::LandUse(payload.clone()),
            RecordType::AssignmentStatus => {
                let update: AssignmentUpdate = from_payload(payload)?;
                validate_percentage("completion_percentage", update.completion_percentage)?;
                if let Some(attempts) = update.contact_attempts {
                    validate_count("contact_attempts", attempts)?;
                }
                RecordPayload::AssignmentStatus(update)
            }
            RecordType::Location => {
                let location: Location = from_payload(payload)?;
                validate_coordinates(location.latitude, location.longitude)?;
                RecordPayload::Location(location)
            }
            RecordType::InterviewSetup => RecordPayload::InterviewSetup(from_payload(payload)?),
            RecordType::Progress => {
                let progress: ProgressUpdate = from_payload(payload)?;
                validate_percentage("completion_percentage", progress.completion_percentage)?;
                RecordPayload::Progress(progress)
            }
            RecordType::Generic(_) => RecordPayload::Generic(payload.clone()),
        };

        Ok(parsed)
    }
}

fn from_payload<T: DeserializeOwned>(payload: &Payload) -> ValidationResult<T> {
    serde_json::from_value(Value::Object(payload.clone())).map_err(|e| {
        ValidationError::InvalidFormat {
            field: "payload".to_string(),
            reason: e.to_string(),
        }
    })
}
