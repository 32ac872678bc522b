//! Bearer-token auth middleware: extracts `Authorization: Bearer sk-...`
//! and delegates to [`crate::auth::verify`] (§4.10, §6).

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::auth::{self, VerifyOutcome};
use crate::error::ApiError;
use crate::http::AppState;

/// Reject the request with 403 unless `Authorization: Bearer <token>`
/// names the master key or an active database-backed key.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Forbidden)?;

    let outcome = auth::verify(&state.db, state.config.master_api_key.as_deref(), token)
        .await
        .map_err(|_| ApiError::Forbidden)?;

    match outcome {
        VerifyOutcome::Valid => Ok(next.run(request).await),
        VerifyOutcome::Invalid => Err(ApiError::Forbidden),
    }
}
