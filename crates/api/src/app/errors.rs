use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use clinsync_infra::admin::AdminError;

pub fn admin_error_to_response(err: AdminError) -> axum::response::Response {
    match &err {
        AdminError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        AdminError::NotRetryable { .. } => {
            json_error(StatusCode::CONFLICT, "not_retryable", err.to_string())
        }
        AdminError::Ledger(e) => {
            tracing::error!(error = %e, "ledger operation failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "ledger_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse a path/query value, answering 400 with `code` on failure.
pub fn parse_param<T>(raw: &str, code: &'static str) -> Result<T, axum::response::Response>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| json_error(StatusCode::BAD_REQUEST, code, e.to_string()))
}
