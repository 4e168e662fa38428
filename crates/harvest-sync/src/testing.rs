//! Test doubles shared by the engine's unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use harvest_core::payload::{
    AssignmentUpdate, Household, InterviewSetup, Labour, Location, ProgressUpdate, SubjectProfile,
};
use harvest_core::{Payload, QueueRecord, RecordType};
use harvest_db::{Database, DbConfig};

use crate::error::DataError;
use crate::sink::DataSink;

pub const AGENT: &str = "agent-7";
pub const DEVICE: &str = "tablet-3";

/// One sink invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkCall {
    /// Record type tag of the handler that ran.
    pub handler: &'static str,
    pub record_id: Option<String>,
    pub subject_id: Option<i64>,
    pub payload: Value,
}

#[derive(Debug, Clone)]
enum Failure {
    Always(String),
    Times(u32, String),
    Panic,
}

#[derive(Debug, Default)]
struct SinkState {
    calls: Vec<SinkCall>,
    failures: HashMap<&'static str, Failure>,
    subjects: HashMap<String, i64>,
    interviews: HashMap<String, i64>,
    next_id: i64,
}

/// In-memory sink that records every call.
///
/// Subjects and interviews are keyed by record id, like the SQLite sink.
#[derive(Debug, Default)]
pub struct RecordingSink {
    state: Mutex<SinkState>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_always(&self, handler: &'static str, message: &str) {
        self.lock()
            .failures
            .insert(handler, Failure::Always(message.to_string()));
    }

    pub fn fail_times(&self, handler: &'static str, times: u32, message: &str) {
        self.lock()
            .failures
            .insert(handler, Failure::Times(times, message.to_string()));
    }

    pub fn panic_on(&self, handler: &'static str) {
        self.lock().failures.insert(handler, Failure::Panic);
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.lock().calls.clone()
    }

    /// Record ids in delivery order (successful or not).
    pub fn delivered_ids(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| c.record_id.clone())
            .collect()
    }

    pub fn subject_count(&self) -> usize {
        self.lock().subjects.len()
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn call(
        &self,
        handler: &'static str,
        record_id: Option<&str>,
        subject_id: Option<i64>,
        payload: impl Serialize,
    ) -> Result<(), DataError> {
        let mut state = self.lock();
        state.calls.push(SinkCall {
            handler,
            record_id: record_id.map(str::to_string),
            subject_id,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        });

        match state.failures.get_mut(handler) {
            Some(Failure::Always(message)) => Err(DataError::Sink(message.clone())),
            Some(Failure::Times(remaining, message)) if *remaining > 0 => {
                *remaining -= 1;
                Err(DataError::Sink(message.clone()))
            }
            Some(Failure::Panic) => panic!("sink panicked in {handler}"),
            _ => Ok(()),
        }
    }

    fn assign(map: &mut HashMap<String, i64>, next_id: &mut i64, key: &str) -> i64 {
        if let Some(id) = map.get(key) {
            return *id;
        }
        *next_id += 1;
        map.insert(key.to_string(), *next_id);
        *next_id
    }
}

#[async_trait]
impl DataSink for RecordingSink {
    async fn upsert_subject(
        &self,
        record: &QueueRecord,
        profile: &SubjectProfile,
    ) -> Result<i64, DataError> {
        self.call(
            "subject_profile",
            Some(&record.record_id),
            record.subject_id,
            profile,
        )?;
        if let Some(id) = record.subject_id {
            return Ok(id);
        }
        let mut state = self.lock();
        let SinkState {
            subjects, next_id, ..
        } = &mut *state;
        Ok(Self::assign(subjects, next_id, &record.record_id))
    }

    async fn upsert_household(
        &self,
        subject_id: i64,
        household: &Household,
    ) -> Result<(), DataError> {
        self.call("household", None, Some(subject_id), household)
    }

    async fn replace_labour(&self, subject_id: i64, labour: &Labour) -> Result<(), DataError> {
        self.call("labour", None, Some(subject_id), labour)
    }

    async fn upsert_asset_inventory(
        &self,
        subject_id: i64,
        inventory: &Payload,
    ) -> Result<(), DataError> {
        self.call("asset_inventory", None, Some(subject_id), inventory)
    }

    async fn upsert_land_use(&self, subject_id: i64, land_use: &Payload) -> Result<(), DataError> {
        self.call("land_use", None, Some(subject_id), land_use)
    }

    async fn update_location(
        &self,
        subject_id: i64,
        location: &Location,
    ) -> Result<(), DataError> {
        self.call("location", None, Some(subject_id), location)
    }

    async fn update_assignment(
        &self,
        _agent_id: &str,
        update: &AssignmentUpdate,
    ) -> Result<(), DataError> {
        self.call("assignment_status", None, None, update)
    }

    async fn create_interview(
        &self,
        record: &QueueRecord,
        setup: &InterviewSetup,
    ) -> Result<i64, DataError> {
        self.call("interview_setup", Some(&record.record_id), None, setup)?;
        let mut state = self.lock();
        let SinkState {
            interviews,
            next_id,
            ..
        } = &mut *state;
        Ok(Self::assign(interviews, next_id, &record.record_id))
    }

    async fn update_progress(
        &self,
        _agent_id: &str,
        progress: &ProgressUpdate,
    ) -> Result<(), DataError> {
        self.call("progress", None, None, progress)
    }

    async fn store_generic(&self, record: &QueueRecord) -> Result<(), DataError> {
        self.call(
            "generic",
            Some(&record.record_id),
            record.subject_id,
            &record.payload,
        )
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// A pending record for the test agent.
pub fn record(record_type: RecordType, payload: Value, subject_id: Option<i64>) -> QueueRecord {
    QueueRecord::new(AGENT, DEVICE, record_type, object(payload), subject_id, None)
}

/// Metadata map with a priority and optional subject reference.
pub fn metadata(priority: &str, subject_ref: Option<&str>) -> Payload {
    let mut map = object(json!({ "priority": priority }));
    if let Some(reference) = subject_ref {
        map.insert("subject_ref".into(), json!(reference));
    }
    map
}

pub async fn memory_db() -> Arc<Database> {
    Arc::new(
        Database::new(DbConfig::in_memory())
            .await
            .expect("in-memory database"),
    )
}
