//! # Field Data Repository
//!
//! Reconciliation writes behind the default SQLite data sink. Every method
//! runs in one transaction and is safe to replay for the same queued record.
//!
//! ## Reconciliation Rules
//! ```text
//! ┌──────────────────────┬──────────────────────────────────────────────────┐
//! │ Record type          │ Write                                            │
//! ├──────────────────────┼──────────────────────────────────────────────────┤
//! │ subject_profile      │ update by id (COALESCE), else by source record,  │
//! │                      │ else insert → new subject id                     │
//! │ household            │ upsert keyed by subject                          │
//! │ labour               │ delete + insert the subject's entries            │
//! │ asset_inventory      │ upsert JSON document keyed by subject            │
//! │ land_use             │ upsert JSON document keyed by subject            │
//! │ location             │ update subject coordinates                       │
//! │ assignment_status    │ update assignment (id + agent)                   │
//! │ interview_setup      │ insert assignment, keyed by source record        │
//! │ progress             │ update completion percentage                     │
//! │ generic              │ INSERT OR IGNORE keyed by record id              │
//! └──────────────────────┴──────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use harvest_core::payload::{
    AssignmentUpdate, Household, InterviewSetup, Labour, Location, ProgressUpdate, SubjectProfile,
};
use harvest_core::Payload;

// =============================================================================
// Stored Rows
// =============================================================================

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredSubject {
    pub subject_id: i64,
    pub source_record_id: Option<String>,
    pub agent_id: Option<String>,
    pub name: Option<String>,
    pub date_of_birth: Option<String>,
    pub gender: Option<String>,
    pub education_level: Option<String>,
    pub marital_status: Option<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location_accuracy: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredHousehold {
    pub subject_id: i64,
    pub household_size: Option<i64>,
    pub dependents: Option<i64>,
    pub primary_income_source: Option<String>,
    pub secondary_income_source: Option<String>,
    pub housing_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredLabourEntry {
    pub labour_type: Option<String>,
    pub count: Option<i64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredAssignment {
    pub assignment_id: i64,
    pub agent_id: String,
    pub source_record_id: Option<String>,
    pub interview_type: Option<String>,
    pub status: String,
    pub scheduled_date: Option<String>,
    pub contact_attempts: i64,
    pub last_contact_date: Option<String>,
    pub notes: Option<String>,
    pub completion_percentage: i64,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredGenericRecord {
    pub record_id: String,
    pub agent_id: String,
    pub record_type: String,
    pub payload: String,
    pub metadata: String,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the field-data tables.
#[derive(Debug, Clone)]
pub struct FieldDataRepository {
    pool: SqlitePool,
}

impl FieldDataRepository {
    pub fn new(pool: SqlitePool) -> Self {
        FieldDataRepository { pool }
    }

    /// Applies a subject profile and returns the subject id it landed on.
    ///
    /// With `subject_id`, updates that subject; absent fields keep their
    /// stored values. Without it, the subject previously created from
    /// `source_record_id` is updated, or a new one is inserted.
    pub async fn upsert_subject(
        &self,
        source_record_id: &str,
        agent_id: &str,
        subject_id: Option<i64>,
        profile: &SubjectProfile,
    ) -> DbResult<i64> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let target = match subject_id {
            Some(id) => Some(id),
            None => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT subject_id FROM subjects WHERE source_record_id = ?1",
                )
                .bind(source_record_id)
                .fetch_optional(&mut *tx)
                .await?
            }
        };

        let id = match target {
            Some(id) => {
                let result = sqlx::query(
                    r#"
                    UPDATE subjects SET
                        name = COALESCE(?2, name),
                        date_of_birth = COALESCE(?3, date_of_birth),
                        gender = COALESCE(?4, gender),
                        education_level = COALESCE(?5, education_level),
                        marital_status = COALESCE(?6, marital_status),
                        phone_number = COALESCE(?7, phone_number),
                        email = COALESCE(?8, email),
                        latitude = COALESCE(?9, latitude),
                        longitude = COALESCE(?10, longitude),
                        updated_at = ?11
                    WHERE subject_id = ?1
                    "#,
                )
                .bind(id)
                .bind(&profile.name)
                .bind(&profile.date_of_birth)
                .bind(&profile.gender)
                .bind(&profile.education_level)
                .bind(&profile.marital_status)
                .bind(&profile.phone_number)
                .bind(&profile.email)
                .bind(profile.latitude)
                .bind(profile.longitude)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(DbError::not_found("Subject", id.to_string()));
                }
                debug!(subject_id = id, "Updated subject");
                id
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO subjects (
                        source_record_id, agent_id, name, date_of_birth, gender,
                        education_level, marital_status, phone_number, email,
                        latitude, longitude, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
                    "#,
                )
                .bind(source_record_id)
                .bind(agent_id)
                .bind(&profile.name)
                .bind(&profile.date_of_birth)
                .bind(&profile.gender)
                .bind(&profile.education_level)
                .bind(&profile.marital_status)
                .bind(&profile.phone_number)
                .bind(&profile.email)
                .bind(profile.latitude)
                .bind(profile.longitude)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                let id = result.last_insert_rowid();
                debug!(subject_id = id, source_record_id, "Created subject");
                id
            }
        };

        tx.commit().await?;
        Ok(id)
    }

    /// Upserts the household section of a subject.
    pub async fn upsert_household(&self, subject_id: i64, household: &Household) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        ensure_subject(&mut tx, subject_id).await?;

        sqlx::query(
            r#"
            INSERT INTO households (
                subject_id, household_size, dependents, primary_income_source,
                secondary_income_source, housing_type, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (subject_id) DO UPDATE SET
                household_size = excluded.household_size,
                dependents = excluded.dependents,
                primary_income_source = excluded.primary_income_source,
                secondary_income_source = excluded.secondary_income_source,
                housing_type = excluded.housing_type,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(subject_id)
        .bind(household.household_size)
        .bind(household.dependents)
        .bind(&household.primary_income_source)
        .bind(&household.secondary_income_source)
        .bind(&household.housing_type)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Replaces all labour entries of a subject.
    pub async fn replace_labour(&self, subject_id: i64, labour: &Labour) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        ensure_subject(&mut tx, subject_id).await?;

        sqlx::query("DELETE FROM labour_entries WHERE subject_id = ?1")
            .bind(subject_id)
            .execute(&mut *tx)
            .await?;

        for entry in &labour.labour_entries {
            sqlx::query(
                r#"
                INSERT INTO labour_entries (subject_id, labour_type, count, description, data_json)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(subject_id)
            .bind(&entry.labour_type)
            .bind(entry.count)
            .bind(&entry.description)
            .bind(serde_json::to_string(entry)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(subject_id, entries = labour.labour_entries.len(), "Replaced labour entries");
        Ok(())
    }

    /// Upserts the asset inventory document of a subject.
    pub async fn upsert_asset_inventory(&self, subject_id: i64, inventory: &Payload) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        ensure_subject(&mut tx, subject_id).await?;

        sqlx::query(
            r#"
            INSERT INTO asset_inventory (subject_id, inventory_json, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (subject_id) DO UPDATE SET
                inventory_json = excluded.inventory_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(subject_id)
        .bind(serde_json::to_string(inventory)?)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Upserts the land use document of a subject.
    pub async fn upsert_land_use(&self, subject_id: i64, land_use: &Payload) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        ensure_subject(&mut tx, subject_id).await?;

        sqlx::query(
            r#"
            INSERT INTO land_use (subject_id, land_use_json, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (subject_id) DO UPDATE SET
                land_use_json = excluded.land_use_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(subject_id)
        .bind(serde_json::to_string(land_use)?)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Sets the coordinates of a subject.
    pub async fn update_location(&self, subject_id: i64, location: &Location) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subjects SET
                latitude = ?2,
                longitude = ?3,
                location_accuracy = ?4,
                updated_at = ?5
            WHERE subject_id = ?1
            "#,
        )
        .bind(subject_id)
        .bind(location.latitude)
        .bind(location.longitude)
        .bind(location.accuracy)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Subject", subject_id.to_string()));
        }
        Ok(())
    }

    /// Applies a status update to one of the agent's assignments.
    ///
    /// Notes are appended on a new line unless the stored notes already end
    /// with them, so a replayed update doesn't duplicate text.
    pub async fn update_assignment(&self, agent_id: &str, update: &AssignmentUpdate) -> DbResult<()> {
        let notes = update.notes.as_deref().filter(|n| !n.is_empty());

        let result = sqlx::query(
            r#"
            UPDATE assignments SET
                status = COALESCE(?3, status),
                contact_attempts = COALESCE(?4, contact_attempts),
                last_contact_date = COALESCE(?5, last_contact_date),
                notes = CASE
                    WHEN ?6 IS NULL THEN notes
                    WHEN notes IS NULL OR notes = '' THEN ?6
                    WHEN substr(notes, -length(?6)) = ?6 THEN notes
                    ELSE notes || char(10) || ?6
                END,
                completion_percentage = ?7,
                updated_at = ?8
            WHERE assignment_id = ?1 AND agent_id = ?2
            "#,
        )
        .bind(update.assignment_id)
        .bind(agent_id)
        .bind(&update.status)
        .bind(update.contact_attempts)
        .bind(&update.last_contact_date)
        .bind(notes)
        .bind(update.completion_percentage)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Assignment", update.assignment_id.to_string()));
        }
        Ok(())
    }

    /// Schedules an interview. Returns the assignment id; replaying the same
    /// source record returns the assignment it created before.
    pub async fn create_interview(
        &self,
        source_record_id: &str,
        agent_id: &str,
        setup: &InterviewSetup,
    ) -> DbResult<i64> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT assignment_id FROM assignments WHERE source_record_id = ?1",
        )
        .bind(source_record_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(id) = existing {
            tx.commit().await?;
            debug!(assignment_id = id, source_record_id, "Interview already scheduled");
            return Ok(id);
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO assignments (
                agent_id, source_record_id, interview_type, status,
                scheduled_date, notes, created_at, updated_at
            ) VALUES (?1, ?2, ?3, 'scheduled', ?4, ?5, ?6, ?6)
            "#,
        )
        .bind(agent_id)
        .bind(source_record_id)
        .bind(&setup.interview_type)
        .bind(&setup.scheduled_date)
        .bind(setup.notes.as_deref().unwrap_or(""))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    /// Records survey progress on one of the agent's assignments.
    pub async fn update_progress(&self, agent_id: &str, progress: &ProgressUpdate) -> DbResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE assignments SET
                completion_percentage = ?3,
                last_activity = ?4,
                updated_at = ?4
            WHERE assignment_id = ?1 AND agent_id = ?2
            "#,
        )
        .bind(progress.assignment_id)
        .bind(agent_id)
        .bind(progress.completion_percentage)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Assignment", progress.assignment_id.to_string()));
        }
        Ok(())
    }

    /// Stores an uninterpreted record. A replay of the same record id is a
    /// no-op.
    pub async fn store_generic(
        &self,
        record_id: &str,
        agent_id: &str,
        record_type: &str,
        payload: &Payload,
        metadata: &Payload,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO generic_records (
                record_id, agent_id, record_type, payload, metadata, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(record_id)
        .bind(agent_id)
        .bind(record_type)
        .bind(serde_json::to_string(payload)?)
        .bind(serde_json::to_string(metadata)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!(record_id, record_type, inserted = result.rows_affected(), "Stored generic record");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub async fn get_subject(&self, subject_id: i64) -> DbResult<Option<StoredSubject>> {
        let subject = sqlx::query_as(
            r#"
            SELECT subject_id, source_record_id, agent_id, name, date_of_birth, gender,
                   education_level, marital_status, phone_number, email,
                   latitude, longitude, location_accuracy
            FROM subjects WHERE subject_id = ?1
            "#,
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subject)
    }

    pub async fn count_subjects(&self) -> DbResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM subjects")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get_household(&self, subject_id: i64) -> DbResult<Option<StoredHousehold>> {
        let household = sqlx::query_as(
            r#"
            SELECT subject_id, household_size, dependents, primary_income_source,
                   secondary_income_source, housing_type
            FROM households WHERE subject_id = ?1
            "#,
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(household)
    }

    pub async fn labour_entries(&self, subject_id: i64) -> DbResult<Vec<StoredLabourEntry>> {
        let entries = sqlx::query_as(
            "SELECT labour_type, count, description FROM labour_entries WHERE subject_id = ?1 ORDER BY id",
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Returns the stored asset inventory document of a subject.
    pub async fn asset_inventory(&self, subject_id: i64) -> DbResult<Option<Payload>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT inventory_json FROM asset_inventory WHERE subject_id = ?1")
                .bind(subject_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(raw.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    /// Returns the stored land use document of a subject.
    pub async fn land_use(&self, subject_id: i64) -> DbResult<Option<Payload>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT land_use_json FROM land_use WHERE subject_id = ?1")
                .bind(subject_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(raw.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    pub async fn get_assignment(&self, assignment_id: i64) -> DbResult<Option<StoredAssignment>> {
        let assignment = sqlx::query_as(
            r#"
            SELECT assignment_id, agent_id, source_record_id, interview_type, status,
                   scheduled_date, contact_attempts, last_contact_date, notes,
                   completion_percentage, last_activity
            FROM assignments WHERE assignment_id = ?1
            "#,
        )
        .bind(assignment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(assignment)
    }

    pub async fn generic_records(&self, agent_id: &str) -> DbResult<Vec<StoredGenericRecord>> {
        let records = sqlx::query_as(
            r#"
            SELECT record_id, agent_id, record_type, payload, metadata
            FROM generic_records WHERE agent_id = ?1 ORDER BY created_at, record_id
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

/// Fails with `NotFound` unless the subject exists.
async fn ensure_subject(conn: &mut SqliteConnection, subject_id: i64) -> DbResult<()> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT subject_id FROM subjects WHERE subject_id = ?1")
        .bind(subject_id)
        .fetch_optional(&mut *conn)
        .await?;

    match exists {
        Some(_) => Ok(()),
        None => Err(DbError::not_found("Subject", subject_id.to_string())),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
