//! # Data Sink
//!
//! The reconciliation target for delivered records, one method per record
//! type. Every method must be transactional and safe to call again for the
//! same record: a retry may follow a failure that happened after the write.
//!
//! ## Implementations
//! - [`SqliteSink`] - writes through [`FieldDataRepository`]
//! - `RecordingSink` (tests) - records calls, scriptable failures

use async_trait::async_trait;

use harvest_core::payload::{
    AssignmentUpdate, Household, InterviewSetup, Labour, Location, ProgressUpdate, SubjectProfile,
};
use harvest_core::{Payload, QueueRecord};
use harvest_db::{Database, FieldDataRepository};

use crate::error::DataError;

/// Ids a handler assigned while applying a record.
///
/// The batch processor copies these onto the queued record so later records
/// that reference it can resolve their subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub assigned_subject_id: Option<i64>,
    pub assigned_assignment_id: Option<i64>,
}

impl HandlerOutcome {
    pub fn applied() -> Self {
        Self::default()
    }

    pub fn subject(id: i64) -> Self {
        HandlerOutcome {
            assigned_subject_id: Some(id),
            ..Default::default()
        }
    }

    pub fn assignment(id: i64) -> Self {
        HandlerOutcome {
            assigned_assignment_id: Some(id),
            ..Default::default()
        }
    }
}

/// Per-record-type reconciliation contract.
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Creates or updates the record's subject and returns its id.
    ///
    /// Without `record.subject_id` the sink must key creation on
    /// `record.record_id`, so a replay lands on the same subject.
    async fn upsert_subject(
        &self,
        record: &QueueRecord,
        profile: &SubjectProfile,
    ) -> Result<i64, DataError>;

    async fn upsert_household(&self, subject_id: i64, household: &Household)
        -> Result<(), DataError>;

    async fn replace_labour(&self, subject_id: i64, labour: &Labour) -> Result<(), DataError>;

    async fn upsert_asset_inventory(
        &self,
        subject_id: i64,
        inventory: &Payload,
    ) -> Result<(), DataError>;

    async fn upsert_land_use(&self, subject_id: i64, land_use: &Payload) -> Result<(), DataError>;

    async fn update_location(&self, subject_id: i64, location: &Location)
        -> Result<(), DataError>;

    async fn update_assignment(
        &self,
        agent_id: &str,
        update: &AssignmentUpdate,
    ) -> Result<(), DataError>;

    /// Schedules an interview and returns the assignment id, keyed on
    /// `record.record_id`.
    async fn create_interview(
        &self,
        record: &QueueRecord,
        setup: &InterviewSetup,
    ) -> Result<i64, DataError>;

    async fn update_progress(
        &self,
        agent_id: &str,
        progress: &ProgressUpdate,
    ) -> Result<(), DataError>;

    /// Stores a record of an unrecognised type without interpreting it.
    async fn store_generic(&self, record: &QueueRecord) -> Result<(), DataError>;
}

// =============================================================================
// SQLite Sink
// =============================================================================

/// Default sink writing to the local field-data tables.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    repo: FieldDataRepository,
}

impl SqliteSink {
    pub fn new(db: &Database) -> Self {
        SqliteSink {
            repo: db.field_data(),
        }
    }
}

#[async_trait]
impl DataSink for SqliteSink {
    async fn upsert_subject(
        &self,
        record: &QueueRecord,
        profile: &SubjectProfile,
    ) -> Result<i64, DataError> {
        Ok(self
            .repo
            .upsert_subject(&record.record_id, &record.agent_id, record.subject_id, profile)
            .await?)
    }

    async fn upsert_household(
        &self,
        subject_id: i64,
        household: &Household,
    ) -> Result<(), DataError> {
        Ok(self.repo.upsert_household(subject_id, household).await?)
    }

    async fn replace_labour(&self, subject_id: i64, labour: &Labour) -> Result<(), DataError> {
        Ok(self.repo.replace_labour(subject_id, labour).await?)
    }

    async fn upsert_asset_inventory(
        &self,
        subject_id: i64,
        inventory: &Payload,
    ) -> Result<(), DataError> {
        Ok(self.repo.upsert_asset_inventory(subject_id, inventory).await?)
    }

    async fn upsert_land_use(&self, subject_id: i64, land_use: &Payload) -> Result<(), DataError> {
        Ok(self.repo.upsert_land_use(subject_id, land_use).await?)
    }

    async fn update_location(
        &self,
        subject_id: i64,
        location: &Location,
    ) -> Result<(), DataError> {
        Ok(self.repo.update_location(subject_id, location).await?)
    }

    async fn update_assignment(
        &self,
        agent_id: &str,
        update: &AssignmentUpdate,
    ) -> Result<(), DataError> {
        Ok(self.repo.update_assignment(agent_id, update).await?)
    }

    async fn create_interview(
        &self,
        record: &QueueRecord,
        setup: &InterviewSetup,
    ) -> Result<i64, DataError> {
        Ok(self
            .repo
            .create_interview(&record.record_id, &record.agent_id, setup)
            .await?)
    }

    async fn update_progress(
        &self,
        agent_id: &str,
        progress: &ProgressUpdate,
    ) -> Result<(), DataError> {
        Ok(self.repo.update_progress(agent_id, progress).await?)
    }

    async fn store_generic(&self, record: &QueueRecord) -> Result<(), DataError> {
        Ok(self
            .repo
            .store_generic(
                &record.record_id,
                &record.agent_id,
                record.record_type.as_str(),
                &record.payload,
                &record.metadata,
            )
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_db, metadata, object, record};
    use harvest_core::{RecordPayload, RecordType};
    use serde_json::json;

    async fn apply(sink: &SqliteSink, record: &QueueRecord) -> Result<i64, DataError> {
        match RecordPayload::parse(&record.record_type, &record.payload)? {
            RecordPayload::SubjectProfile(profile) => sink.upsert_subject(record, &profile).await,
            _ => panic!("expected a subject profile"),
        }
    }

    #[tokio::test]
    async fn test_subject_creation_keyed_on_record_id() {
        let db = memory_db().await;
        let sink = SqliteSink::new(&db);
        let first = record(
            RecordType::SubjectProfile,
            json!({"name": "Holder 0001", "gender": "F"}),
            None,
        );
        let second = record(RecordType::SubjectProfile, json!({"name": "Holder 0002"}), None);

        let id = apply(&sink, &first).await.unwrap();
        // Replay after a lost acknowledgement.
        assert_eq!(apply(&sink, &first).await.unwrap(), id);
        assert_ne!(apply(&sink, &second).await.unwrap(), id);

        assert_eq!(db.field_data().count_subjects().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_subject_update_keeps_absent_fields() {
        let db = memory_db().await;
        let sink = SqliteSink::new(&db);
        let created = record(
            RecordType::SubjectProfile,
            json!({"name": "Holder 0001", "phone_number": "242-555-0101"}),
            None,
        );
        let id = apply(&sink, &created).await.unwrap();

        let update = record(
            RecordType::SubjectProfile,
            json!({"marital_status": "married"}),
            Some(id),
        );
        assert_eq!(apply(&sink, &update).await.unwrap(), id);

        let stored = db.field_data().get_subject(id).await.unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("Holder 0001"));
        assert_eq!(stored.phone_number.as_deref(), Some("242-555-0101"));
        assert_eq!(stored.marital_status.as_deref(), Some("married"));
    }

    #[tokio::test]
    async fn test_unknown_subject_is_retryable_not_found() {
        let db = memory_db().await;
        let sink = SqliteSink::new(&db);

        let err = sink
            .update_location(
                404,
                &Location {
                    latitude: 25.03,
                    longitude: -77.39,
                    accuracy: None,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DataError::NotFound { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_generic_record_stored_once() {
        let db = memory_db().await;
        let sink = SqliteSink::new(&db);
        let mut rec = record(
            RecordType::parse("livestock_poultry"),
            json!({"goats": 3}),
            None,
        );
        rec.metadata = metadata("low", None);

        sink.store_generic(&rec).await.unwrap();
        sink.store_generic(&rec).await.unwrap();

        let stored = db.field_data().generic_records(&rec.agent_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].record_type, "livestock_poultry");
        let payload: Payload = serde_json::from_str(&stored[0].payload).unwrap();
        assert_eq!(payload, object(json!({"goats": 3})));
    }

    #[tokio::test]
    async fn test_household_after_subject_through_engine() {
        use crate::clock::VirtualScheduler;
        use crate::config::SyncConfig;
        use crate::orchestrator::SyncOrchestrator;
        use crate::testing::{AGENT, DEVICE};
        use std::sync::Arc;

        let db = memory_db().await;
        let engine = SyncOrchestrator::builder(SyncConfig::for_agent(AGENT, DEVICE))
            .with_database(db.clone())
            .with_scheduler(Arc::new(VirtualScheduler::new()))
            .build()
            .unwrap();

        let profile = engine
            .enqueue("holder_information", object(json!({"name": "Holder 0001"})), None, None)
            .await
            .unwrap();
        engine
            .enqueue(
                "household_information",
                object(json!({"household_size": 6, "housing_type": "concrete"})),
                None,
                Some(metadata("high", Some(profile.record_id.as_str()))),
            )
            .await
            .unwrap();

        let result = engine.attempt_sync(false).await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.synced, 2);

        let subject_id = engine
            .queue()
            .get(&profile.record_id)
            .await
            .unwrap()
            .unwrap()
            .subject_id
            .unwrap();
        let household = db
            .field_data()
            .get_household(subject_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(household.household_size, Some(6));
        assert_eq!(household.housing_type.as_deref(), Some("concrete"));
    }
}
