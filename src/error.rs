//! HTTP-facing error type and its response mapping (§7).
//!
//! Only transport failures (C2), storage failures (C8), and auth failures
//! (C9) ever reach this type -- firewall/FHIR validation failures are
//! recovered locally by the pipeline orchestrator and surface as a normal
//! 200 response with `status=partial|failed`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors that cross the HTTP boundary (§7).
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Bad multipart, zero/too-many files, or unsupported MIME.
    #[error("{0}")]
    BadRequest(String),
    /// Missing, invalid, or revoked bearer token.
    #[error("forbidden")]
    Forbidden,
    /// Upstream LLM unreachable after retries, or semaphore reject.
    #[error("upstream unavailable")]
    Unavailable {
        /// Seconds the client should wait before retrying.
        retry_after_secs: u64,
    },
    /// Database or disk failure.
    #[error("storage error: {0}")]
    Storage(String),
    /// Unknown submission id.
    #[error("not found")]
    NotFound,
    /// Concurrent rerun on the same submission id.
    #[error("busy")]
    Busy,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, retry_after) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            Self::Forbidden => (StatusCode::FORBIDDEN, self.to_string(), None),
            Self::Unavailable { retry_after_secs } => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string(), Some(*retry_after_secs))
            }
            Self::Storage(_) => (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable".to_owned(), None),
            Self::NotFound => (StatusCode::NOT_FOUND, self.to_string(), None),
            Self::Busy => (StatusCode::CONFLICT, self.to_string(), None),
        };

        let body = Json(json!({ "error": message }));
        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn not_found_maps_to_404() {
        let response = ApiError::NotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unavailable_sets_retry_after_header() {
        let response = ApiError::Unavailable { retry_after_secs: 30 }.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(axum::http::header::RETRY_AFTER).unwrap(), "30");
    }

    #[tokio::test]
    async fn storage_error_body_does_not_leak_raw_message() {
        let response = ApiError::Storage("disk full at /var/lib/x".to_owned()).into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert!(!text.contains("/var/lib/x"));
    }
}
