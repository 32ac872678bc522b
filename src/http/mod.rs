//! HTTP surface (C10): axum router, shared state, and bearer-auth middleware.
//!
//! Wires the multipart ingest endpoint, listing/history endpoints, rerun,
//! notes, AI summary, and original-file serving, all authenticated except
//! `/auth/register` (§4.10, §6). A `DefaultBodyLimit` layer bounds the
//! whole request body; MIME and per-file size checks inside `ingest`
//! itself reject individual bad fields before the pipeline ever runs.

pub mod middleware;
pub mod routes;

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::{Mutex, Semaphore};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::llm::LlmClient;
use crate::store::db::Db;

/// Shared application state handed to every handler.
pub struct AppState {
    /// Durable store.
    pub db: Db,
    /// Upstream LLM client.
    pub llm: Arc<dyn LlmClient>,
    /// Resolved runtime configuration.
    pub config: Config,
    /// Bounds concurrent in-flight LLM calls (§5).
    pub llm_semaphore: Arc<Semaphore>,
    /// Submission ids currently mid-rerun, guarding against concurrent reruns (§5).
    pub rerun_locks: Mutex<HashSet<Uuid>>,
}

/// Build the full router over `state`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/v1/ingest", post(routes::ingest))
        .route("/api/v1/submissions", get(routes::list_submissions))
        .route("/api/v1/patients", get(routes::list_patients))
        .route("/api/v1/patients/:pid/history", get(routes::patient_history))
        .route("/api/v1/rerun/:id", post(routes::rerun))
        .route("/api/v1/submissions/:id/notes", post(routes::save_notes))
        .route("/api/v1/submissions/:id/ai_summary", post(routes::ai_summary))
        .route("/api/v1/files/*relpath", get(routes::serve_file))
        .route_layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::require_auth,
        ));

    Router::new()
        .route("/api/v1/auth/register", post(routes::register))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(routes::MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}
