//! SQLite-backed durable store for submissions and API keys (§4.8, §6).
//!
//! Mirrors the connection-setup and upsert idioms of this corpus's SQLite
//! state layer: WAL journal mode, foreign keys on, schema applied via a
//! single `include_str!`-embedded migration, and row-tuple-to-struct
//! conversion functions kept separate from any `FromRow` derive so the
//! public structs stay free of sqlx attributes.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use uuid::Uuid;

/// A persisted submission row (§3 Submission).
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionRow {
    /// Opaque submission id.
    pub id: Uuid,
    /// Client-provided patient identifier.
    pub patient_id: String,
    /// Primary source filename.
    pub filename: String,
    /// URL path to the first persisted image, served by the HTTP layer.
    pub image_url: String,
    /// `completed | failed | partial`.
    pub status: String,
    /// Assembled (or fallback) FHIR bundle.
    pub fhir_bundle: Value,
    /// Raw LLM output, preserved for audit.
    pub raw_extraction: String,
    /// Clinician free-text notes.
    pub doctor_notes: String,
    /// Generated markdown summary.
    pub ai_summary: String,
    /// Creation/rerun timestamp.
    pub created_at: DateTime<Utc>,
}

/// Fields needed to insert a new submission.
pub struct NewSubmission {
    /// Opaque submission id, generated by the caller.
    pub id: Uuid,
    /// Client-provided patient identifier.
    pub patient_id: String,
    /// Primary source filename.
    pub filename: String,
    /// URL path to the first persisted image.
    pub image_url: String,
    /// `completed | failed | partial`.
    pub status: String,
    /// Assembled (or fallback) FHIR bundle.
    pub fhir_bundle: Value,
    /// Raw LLM output.
    pub raw_extraction: String,
}

/// `{patient_id, file_count, last_updated}` summary row for listing.
#[derive(Debug, Clone, Serialize)]
pub struct PatientSummary {
    /// Patient identifier.
    pub patient_id: String,
    /// Number of submissions on record for this patient.
    pub file_count: i64,
    /// Most recent submission timestamp for this patient.
    pub last_updated: DateTime<Utc>,
}

/// A persisted API key row (§3 APIKey).
#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    /// The key itself, `sk-<hex>`.
    pub key: String,
    /// Human label.
    pub name: String,
    /// `admin | frontend | service | internal`.
    pub role: String,
    /// Revocation flag.
    pub is_active: bool,
    /// Issuance timestamp.
    pub created_at: DateTime<Utc>,
    /// Last successful verification, if any.
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Durable store, backed by a SQLite connection pool.
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open (or create) the database at `path` and apply the schema
    /// migration.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the migration
    /// fails to apply.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open db at {}", path.display()))?;

        let migration_sql = include_str!("../../migrations/001_init.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply schema migration")?;

        Ok(Self { pool })
    }

    /// Open an in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the migration fails to apply.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory db")?;

        let migration_sql = include_str!("../../migrations/001_init.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply schema migration")?;

        Ok(Self { pool })
    }

    /// Insert a new submission row.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn insert_submission(&self, submission: &NewSubmission) -> anyhow::Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO submissions
                (id, patient_id, filename, image_url, status, fhir_bundle, raw_extraction, doctor_notes, ai_summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '', '', ?8)",
        )
        .bind(submission.id.to_string())
        .bind(&submission.patient_id)
        .bind(&submission.filename)
        .bind(&submission.image_url)
        .bind(&submission.status)
        .bind(submission.fhir_bundle.to_string())
        .bind(&submission.raw_extraction)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to insert submission")?;

        Ok(())
    }

    /// Replace a submission's bundle/status/raw extraction and bump
    /// `created_at`, as part of `rerun(id)` (§4.8, §9 decision 2).
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn rerun_update(
        &self,
        id: Uuid,
        status: &str,
        fhir_bundle: &Value,
        raw_extraction: &str,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE submissions SET
                status = ?2,
                fhir_bundle = ?3,
                raw_extraction = ?4,
                created_at = ?5
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(status)
        .bind(fhir_bundle.to_string())
        .bind(raw_extraction)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to update submission on rerun")?;

        Ok(())
    }

    /// Overwrite `doctor_notes` only.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn save_notes(&self, id: Uuid, notes: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE submissions SET doctor_notes = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(notes)
            .execute(&self.pool)
            .await
            .context("failed to save notes")?;

        Ok(())
    }

    /// Overwrite `ai_summary` only.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn set_ai_summary(&self, id: Uuid, summary: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE submissions SET ai_summary = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(summary)
            .execute(&self.pool)
            .await
            .context("failed to set ai summary")?;

        Ok(())
    }

    /// Fetch one submission by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn get(&self, id: Uuid) -> anyhow::Result<Option<SubmissionRow>> {
        let row: Option<SubmissionRowRaw> = sqlx::query_as(
            "SELECT id, patient_id, filename, image_url, status, fhir_bundle, raw_extraction, doctor_notes, ai_summary, created_at
             FROM submissions WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch submission")?;

        row.map(submission_row_from_raw).transpose()
    }

    /// Most recent submissions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn list_recent(&self, limit: i64) -> anyhow::Result<Vec<SubmissionRow>> {
        let rows: Vec<SubmissionRowRaw> = sqlx::query_as(
            "SELECT id, patient_id, filename, image_url, status, fhir_bundle, raw_extraction, doctor_notes, ai_summary, created_at
             FROM submissions ORDER BY created_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list recent submissions")?;

        rows.into_iter().map(submission_row_from_raw).collect()
    }

    /// Distinct patients with submission counts and last-updated time.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn list_patients(&self) -> anyhow::Result<Vec<PatientSummary>> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT patient_id, COUNT(*) AS file_count, MAX(created_at) AS last_updated
             FROM submissions GROUP BY patient_id ORDER BY last_updated DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list patients")?;

        rows.into_iter()
            .map(|(patient_id, file_count, last_updated)| {
                Ok(PatientSummary {
                    patient_id,
                    file_count,
                    last_updated: DateTime::parse_from_rfc3339(&last_updated)
                        .context("invalid last_updated timestamp")?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }

    /// Submissions for one patient, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn patient_history(&self, patient_id: &str) -> anyhow::Result<Vec<SubmissionRow>> {
        let rows: Vec<SubmissionRowRaw> = sqlx::query_as(
            "SELECT id, patient_id, filename, image_url, status, fhir_bundle, raw_extraction, doctor_notes, ai_summary, created_at
             FROM submissions WHERE patient_id = ?1 ORDER BY created_at DESC",
        )
        .bind(patient_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch patient history")?;

        rows.into_iter().map(submission_row_from_raw).collect()
    }

    /// Insert a newly issued API key.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn insert_api_key(&self, key: &ApiKeyRow) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO api_keys (key, name, role, is_active, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&key.key)
        .bind(&key.name)
        .bind(&key.role)
        .bind(key.is_active)
        .bind(key.created_at.to_rfc3339())
        .bind(key.last_used_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .context("failed to insert api key")?;

        Ok(())
    }

    /// Fetch one API key by its literal value.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn find_api_key(&self, key: &str) -> anyhow::Result<Option<ApiKeyRow>> {
        let row: Option<ApiKeyRowTuple> = sqlx::query_as(
            "SELECT key, name, role, is_active, created_at, last_used_at FROM api_keys WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch api key")?;

        row.map(api_key_row_from_tuple).transpose()
    }

    /// Best-effort update of `last_used_at` for a key (§4.9 "asynchronously,
    /// best-effort").
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; callers may choose to ignore it.
    pub async fn touch_last_used(&self, key: &str) -> anyhow::Result<()> {
        let now = Utc::now();
        sqlx::query("UPDATE api_keys SET last_used_at = ?2 WHERE key = ?1")
            .bind(key)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await
            .context("failed to touch api key")?;

        Ok(())
    }

    /// Revoke a key (used by tests exercising scenario E; no HTTP endpoint
    /// exposes this directly per §6).
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn deactivate_api_key(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE api_keys SET is_active = 0 WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("failed to deactivate api key")?;

        Ok(())
    }
}

/// Raw row shape as read from `submissions`, before timestamp/JSON parsing.
#[derive(sqlx::FromRow)]
struct SubmissionRowRaw {
    id: String,
    patient_id: String,
    filename: String,
    image_url: String,
    status: String,
    fhir_bundle: String,
    raw_extraction: String,
    doctor_notes: String,
    ai_summary: String,
    created_at: String,
}

fn submission_row_from_raw(raw: SubmissionRowRaw) -> anyhow::Result<SubmissionRow> {
    Ok(SubmissionRow {
        id: Uuid::parse_str(&raw.id).context("invalid submission id")?,
        patient_id: raw.patient_id,
        filename: raw.filename,
        image_url: raw.image_url,
        status: raw.status,
        fhir_bundle: serde_json::from_str(&raw.fhir_bundle).context("invalid stored bundle json")?,
        raw_extraction: raw.raw_extraction,
        doctor_notes: raw.doctor_notes,
        ai_summary: raw.ai_summary,
        created_at: DateTime::parse_from_rfc3339(&raw.created_at)
            .context("invalid created_at timestamp")?
            .with_timezone(&Utc),
    })
}

type ApiKeyRowTuple = (String, String, String, bool, String, Option<String>);

fn api_key_row_from_tuple(t: ApiKeyRowTuple) -> anyhow::Result<ApiKeyRow> {
    let (key, name, role, is_active, created_at, last_used_at) = t;
    Ok(ApiKeyRow {
        key,
        name,
        role,
        is_active,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .context("invalid created_at timestamp")?
            .with_timezone(&Utc),
        last_used_at: last_used_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .context("invalid last_used_at timestamp")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_submission(id: Uuid) -> NewSubmission {
        NewSubmission {
            id,
            patient_id: "patient-1".to_owned(),
            filename: "report.png".to_owned(),
            image_url: "/api/v1/files/sub/report.png".to_owned(),
            status: "completed".to_owned(),
            fhir_bundle: serde_json::json!({"resourceType": "Bundle"}),
            raw_extraction: "raw".to_owned(),
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_round_trips() {
        let db = Db::open_in_memory().await.expect("open db");
        let id = Uuid::new_v4();
        db.insert_submission(&new_submission(id)).await.expect("insert");

        let fetched = db.get(id).await.expect("get").expect("row present");
        assert_eq!(fetched.patient_id, "patient-1");
        assert_eq!(fetched.status, "completed");
    }

    #[tokio::test]
    async fn rerun_update_bumps_created_at() {
        let db = Db::open_in_memory().await.expect("open db");
        let id = Uuid::new_v4();
        db.insert_submission(&new_submission(id)).await.expect("insert");
        let before = db.get(id).await.expect("get").expect("row").created_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        db.rerun_update(id, "completed", &serde_json::json!({"resourceType": "Bundle"}), "raw2")
            .await
            .expect("rerun update");

        let after = db.get(id).await.expect("get").expect("row").created_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn api_key_lifecycle_deactivate_blocks_future_lookup_as_active() {
        let db = Db::open_in_memory().await.expect("open db");
        let key = ApiKeyRow {
            key: "sk-testkey".to_owned(),
            name: "test".to_owned(),
            role: "frontend".to_owned(),
            is_active: true,
            created_at: Utc::now(),
            last_used_at: None,
        };
        db.insert_api_key(&key).await.expect("insert key");
        db.deactivate_api_key("sk-testkey").await.expect("deactivate");

        let fetched = db.find_api_key("sk-testkey").await.expect("find").expect("present");
        assert!(!fetched.is_active);
    }

    #[tokio::test]
    async fn list_patients_groups_by_patient_id() {
        let db = Db::open_in_memory().await.expect("open db");
        db.insert_submission(&new_submission(Uuid::new_v4())).await.expect("insert 1");
        db.insert_submission(&new_submission(Uuid::new_v4())).await.expect("insert 2");

        let patients = db.list_patients().await.expect("list patients");
        assert_eq!(patients.len(), 1);
        assert_eq!(patients[0].file_count, 2);
    }
}
