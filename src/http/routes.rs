//! Route handlers for the HTTP surface (§4.10, §6).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth;
use crate::error::ApiError;
use crate::http::AppState;
use crate::llm::{ChatContentPart, ChatRequest, MAX_IMAGES_PER_CALL};
use crate::pipeline::{self, PipelineConfig, SubmissionStatus};
use crate::prompts;
use crate::store::db::NewSubmission;
use crate::store::files;

/// Maximum time a request waits for an LLM concurrency slot before 503 (§5).
const SEMAPHORE_WAIT: Duration = Duration::from_secs(30);

/// Per-file size cap; an oversized individual field is a client mistake,
/// not a transport-level overrun, so it is rejected with 400 (§7 ClientError
/// "file too large" -> 400) rather than 413.
const MAX_FILE_SIZE_BYTES: usize = 20 * 1024 * 1024;

/// Upper bound on the whole multipart body, layered onto the router as a
/// `DefaultBodyLimit` (`http::build_router`). This is the outer safety net
/// that actually produces the 413 the route table documents (§6 ingest
/// response codes) for a body oversized before any individual field can be
/// inspected; sized for `MAX_IMAGES_PER_CALL` files at the per-file cap
/// plus slack for multipart framing.
pub(crate) const MAX_REQUEST_BODY_BYTES: usize = MAX_FILE_SIZE_BYTES * MAX_IMAGES_PER_CALL + 1024 * 1024;

/// Declared content-types accepted for an uploaded file (§4.1 "declared MIME
/// ∈ image/* or application/pdf").
fn mime_allowed(mime: &str) -> bool {
    mime.starts_with("image/") || mime == "application/pdf"
}

fn pipeline_config(config: &crate::config::Config) -> PipelineConfig {
    PipelineConfig {
        max_attempts: config.max_attempts,
        request_deadline: Duration::from_millis(config.request_deadline_ms),
        strict_extraction: config.strict_extraction,
        require_expected_tests: config.require_expected_tests,
        require_patient: config.require_patient,
        allow_report_date: config.allow_report_date,
        min_observations: config.min_observations,
    }
}

async fn acquire_llm_permit(state: &AppState) -> Result<tokio::sync::SemaphorePermit<'_>, ApiError> {
    tokio::time::timeout(SEMAPHORE_WAIT, state.llm_semaphore.acquire())
        .await
        .map_err(|_| ApiError::Unavailable { retry_after_secs: SEMAPHORE_WAIT.as_secs() })?
        .map_err(|_| ApiError::Unavailable { retry_after_secs: SEMAPHORE_WAIT.as_secs() })
}

fn status_str(status: &SubmissionStatus) -> &'static str {
    match status {
        SubmissionStatus::Complete => "completed",
        SubmissionStatus::Partial => "partial",
        SubmissionStatus::Failed => "failed",
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    name: String,
}

/// `POST /api/v1/auth/register`.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<auth::IssuedKey>, ApiError> {
    let issued = auth::register(&state.db, &body.name).await?;
    Ok(Json(issued))
}

/// `POST /api/v1/ingest`.
pub async fn ingest(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Result<Json<Value>, ApiError> {
    let mut patient_id: Option<String> = None;
    let mut uploads: Vec<(String, String, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "patient_id" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("invalid patient_id field: {e}")))?;
                patient_id = Some(text);
            }
            "files" | "files[]" => {
                let filename = field.file_name().unwrap_or("upload").to_owned();
                let mime = field.content_type().unwrap_or("application/octet-stream").to_owned();
                if !mime_allowed(&mime) {
                    return Err(ApiError::BadRequest(format!("unsupported file type: {mime}")));
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("invalid file field: {e}")))?;
                if bytes.len() > MAX_FILE_SIZE_BYTES {
                    return Err(ApiError::BadRequest(format!(
                        "file {filename} exceeds the {MAX_FILE_SIZE_BYTES}-byte limit"
                    )));
                }
                uploads.push((filename, mime, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let patient_id = patient_id.ok_or_else(|| ApiError::BadRequest("patient_id is required".to_owned()))?;
    if uploads.is_empty() || uploads.len() > MAX_IMAGES_PER_CALL {
        return Err(ApiError::BadRequest(format!(
            "expected 1-{MAX_IMAGES_PER_CALL} files, got {}",
            uploads.len()
        )));
    }

    let submission_id = Uuid::new_v4();
    let persist_input: Vec<(String, Vec<u8>)> =
        uploads.iter().map(|(name, _, bytes)| (name.clone(), bytes.clone())).collect();
    let stored = files::persist_files(&state.config.uploads_dir, submission_id, &persist_input)?;

    let images: Vec<ChatContentPart> =
        uploads.iter().map(|(_, mime, bytes)| ChatContentPart::image(mime, bytes)).collect();

    let _permit = acquire_llm_permit(&state).await?;
    let config = pipeline_config(&state.config);
    let outcome = pipeline::run(Arc::clone(&state.llm), images, &patient_id, &config)
        .await
        .map_err(|_| ApiError::Unavailable { retry_after_secs: 5 })?;

    let bundle = outcome
        .bundle
        .clone()
        .unwrap_or_else(|| json!({"resourceType": "Bundle", "type": "collection", "entry": []}));

    let new_submission = NewSubmission {
        id: submission_id,
        patient_id: patient_id.clone(),
        filename: uploads[0].0.clone(),
        image_url: stored.first().map(|s| s.relative_path.clone()).unwrap_or_default(),
        status: status_str(&outcome.status).to_owned(),
        fhir_bundle: bundle.clone(),
        raw_extraction: outcome.raw_extraction.clone(),
    };
    state.db.insert_submission(&new_submission).await?;

    Ok(Json(json!({
        "submission_id": submission_id,
        "patient_id": patient_id,
        "db_persisted": true,
        "fhir_bundle": bundle,
    })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

/// Default page size for `GET /api/v1/submissions` when `limit` is absent.
const DEFAULT_LIST_LIMIT: i64 = 50;

/// `GET /api/v1/submissions?limit=N`.
pub async fn list_submissions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let rows = state.db.list_recent(limit).await?;
    Ok(Json(json!(rows)))
}

/// `GET /api/v1/patients`.
pub async fn list_patients(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let patients = state.db.list_patients().await?;
    Ok(Json(json!(patients)))
}

/// `GET /api/v1/patients/{pid}/history`.
pub async fn patient_history(
    State(state): State<Arc<AppState>>,
    Path(patient_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let rows = state.db.patient_history(&patient_id).await?;
    Ok(Json(json!(rows)))
}

/// `POST /api/v1/rerun/{id}` (§5 "serialize via a per-submission advisory lock").
pub async fn rerun(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Json<Value>, ApiError> {
    {
        let mut locks = state.rerun_locks.lock().await;
        if !locks.insert(id) {
            return Err(ApiError::Busy);
        }
    }

    let result = rerun_inner(&state, id).await;

    state.rerun_locks.lock().await.remove(&id);
    result
}

async fn rerun_inner(state: &AppState, id: Uuid) -> Result<Json<Value>, ApiError> {
    let existing = state.db.get(id).await?.ok_or(ApiError::NotFound)?;

    let stored = files::list_submission_files(&state.config.uploads_dir, id)
        .map_err(|e| ApiError::Storage(e.to_string()))?;
    if stored.is_empty() {
        return Err(ApiError::Storage("no persisted files found for submission".to_owned()));
    }
    let mut images = Vec::with_capacity(stored.len());
    for file in &stored {
        let bytes = std::fs::read(&file.absolute_path).map_err(|e| ApiError::Storage(e.to_string()))?;
        let mime = guess_mime(&file.relative_path);
        images.push(ChatContentPart::image(mime, &bytes));
    }

    let _permit = acquire_llm_permit(state).await?;
    let config = pipeline_config(&state.config);
    let outcome = pipeline::run(Arc::clone(&state.llm), images, &existing.patient_id, &config)
        .await
        .map_err(|_| ApiError::Unavailable { retry_after_secs: 5 })?;

    let bundle = outcome
        .bundle
        .clone()
        .unwrap_or_else(|| json!({"resourceType": "Bundle", "type": "collection", "entry": []}));

    state
        .db
        .rerun_update(id, status_str(&outcome.status), &bundle, &outcome.raw_extraction)
        .await?;

    Ok(Json(json!({
        "submission_id": id,
        "status": status_str(&outcome.status),
        "fhir_bundle": bundle,
    })))
}

#[derive(Debug, Deserialize)]
struct NotesBody {
    notes: String,
}

/// `POST /api/v1/submissions/{id}/notes`.
pub async fn save_notes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<NotesBody>,
) -> Result<Json<Value>, ApiError> {
    state.db.get(id).await?.ok_or(ApiError::NotFound)?;
    state.db.save_notes(id, &body.notes).await?;
    Ok(Json(json!({ "submission_id": id, "saved": true })))
}

/// `POST /api/v1/submissions/{id}/ai_summary` (§9 decision 3: regenerates on every call).
pub async fn ai_summary(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Json<Value>, ApiError> {
    let submission = state.db.get(id).await?.ok_or(ApiError::NotFound)?;

    let _permit = acquire_llm_permit(&state).await?;
    let messages = prompts::build_synthesis(&submission.fhir_bundle.to_string(), &submission.doctor_notes);
    let request = ChatRequest { messages, temperature: 0.0, max_tokens: None };
    let response = state
        .llm
        .chat(request)
        .await
        .map_err(|_| ApiError::Unavailable { retry_after_secs: 5 })?;

    state.db.set_ai_summary(id, &response.text).await?;
    Ok(Json(json!({ "summary": response.text })))
}

/// `GET /api/v1/files/{relpath}`.
pub async fn serve_file(
    State(state): State<Arc<AppState>>,
    Path(relpath): Path<String>,
) -> Result<Response, ApiError> {
    let absolute = files::resolve_safe_path(&state.config.uploads_dir, &relpath)
        .map_err(|_| ApiError::NotFound)?;
    let bytes = std::fs::read(&absolute).map_err(|_| ApiError::NotFound)?;
    let mime = guess_mime(&relpath);
    Ok(([(axum::http::header::CONTENT_TYPE, mime)], bytes).into_response())
}

fn guess_mime(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".pdf") {
        "application/pdf"
    } else {
        "application/octet-stream"
    }
}
