use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use claude_agent::ClaudeAgentError;
use ralph_core::RalphError;

// ---------------------------------------------------------------------------
// Internal sentinel for explicit 409 Conflict errors
// ---------------------------------------------------------------------------

/// Private sentinel error type used to carry an explicit HTTP 409 through
/// the `anyhow::Error` chain without touching the `RalphError` enum.
#[derive(Debug)]
struct ConflictError(String);

impl std::fmt::Display for ConflictError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConflictError {}

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// Construct a 400 Bad Request error naming the offending field.
    pub fn bad_request(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self(RalphError::invalid_field(field, reason).into())
    }

    /// Construct a 409 Conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self(ConflictError(msg.into()).into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(c) = self.0.downcast_ref::<ConflictError>() {
            let body = serde_json::json!({ "error": c.0.clone() });
            return (StatusCode::CONFLICT, axum::Json(body)).into_response();
        }

        if let Some(rejection) = self.0.downcast_ref::<JsonRejection>() {
            let body = serde_json::json!({
                "error": format!("invalid request body: {}", rejection.body_text()),
            });
            return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
        }

        if let Some(e) = self.0.downcast_ref::<RalphError>() {
            let status = match e {
                RalphError::HandoffConflict(existing) => {
                    let body = serde_json::json!({
                        "error": e.to_string(),
                        "existing": existing,
                    });
                    return (StatusCode::CONFLICT, axum::Json(body)).into_response();
                }
                RalphError::NotInitialized => StatusCode::BAD_REQUEST,
                e if e.is_not_found() => StatusCode::NOT_FOUND,
                e if e.is_validation() => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let body = serde_json::json!({ "error": e.to_string() });
            return (status, axum::Json(body)).into_response();
        }

        if let Some(e) = self.0.downcast_ref::<ClaudeAgentError>() {
            let body = serde_json::json!({
                "error": e.to_string(),
                "output": e.raw_output(),
            });
            return (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response();
        }

        let body = serde_json::json!({ "error": format!("{:#}", self.0) });
        (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
