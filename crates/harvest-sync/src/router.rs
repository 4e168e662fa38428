//! # Type Router
//!
//! Maps a record's type to its [`DataSink`] handler.
//!
//! ```text
//! QueueRecord ──► RecordPayload::parse ──► match variant ──► DataSink method
//!                      │                                          │
//!                      └─ InvalidPayload (permanent)              └─ HandlerOutcome
//! ```
//!
//! Dispatch is a `match` over the closed [`RecordPayload`] enum, so every
//! record type has exactly one handler at compile time. Unrecognised tags
//! parse as `Generic` and are stored raw; no record type can fail routing.

use std::sync::Arc;

use tracing::debug;

use harvest_core::{QueueRecord, RecordPayload};

use crate::error::DataError;
use crate::sink::{DataSink, HandlerOutcome};

/// Dispatches records to a sink.
#[derive(Clone)]
pub struct TypeRouter {
    sink: Arc<dyn DataSink>,
}

impl TypeRouter {
    pub fn new(sink: Arc<dyn DataSink>) -> Self {
        TypeRouter { sink }
    }

    /// Applies one record through its handler.
    pub async fn route(&self, record: &QueueRecord) -> Result<HandlerOutcome, DataError> {
        let payload = RecordPayload::parse(&record.record_type, &record.payload)?;
        let sink = self.sink.as_ref();

        debug!(
            record_id = %record.record_id,
            record_type = %record.record_type,
            subject_id = ?record.subject_id,
            "Routing record"
        );

        let outcome = match payload {
            RecordPayload::SubjectProfile(profile) => {
                HandlerOutcome::subject(sink.upsert_subject(record, &profile).await?)
            }
            RecordPayload::Household(household) => {
                sink.upsert_household(subject_of(record)?, &household).await?;
                HandlerOutcome::applied()
            }
            RecordPayload::Labour(labour) => {
                sink.replace_labour(subject_of(record)?, &labour).await?;
                HandlerOutcome::applied()
            }
            RecordPayload::AssetInventory(inventory) => {
                sink.upsert_asset_inventory(subject_of(record)?, &inventory)
                    .await?;
                HandlerOutcome::applied()
            }
            RecordPayload::LandUse(land_use) => {
                sink.upsert_land_use(subject_of(record)?, &land_use).await?;
                HandlerOutcome::applied()
            }
            RecordPayload::Location(location) => {
                sink.update_location(subject_of(record)?, &location).await?;
                HandlerOutcome::applied()
            }
            RecordPayload::AssignmentStatus(update) => {
                sink.update_assignment(&record.agent_id, &update).await?;
                HandlerOutcome::applied()
            }
            RecordPayload::InterviewSetup(setup) => {
                HandlerOutcome::assignment(sink.create_interview(record, &setup).await?)
            }
            RecordPayload::Progress(progress) => {
                sink.update_progress(&record.agent_id, &progress).await?;
                HandlerOutcome::applied()
            }
            RecordPayload::Generic(_) => {
                sink.store_generic(record).await?;
                HandlerOutcome::applied()
            }
        };

        Ok(outcome)
    }
}

fn subject_of(record: &QueueRecord) -> Result<i64, DataError> {
    record.subject_id.ok_or_else(|| DataError::MissingSubject {
        record_type: record.record_type.to_string(),
    })
}
