//! Unified HTTP error type and upstream failure taxonomy.
//!
//! [`AppError`] wraps [`anyhow::Error`] and converts it into an appropriate
//! HTTP response automatically via [`IntoResponse`]. Every handler that can
//! fail can return `Result<T, AppError>` and propagate errors with `?`.
//!
//! [`FailureCategory`] classifies a completed (or failed) upstream attempt so
//! the balancer can decide whether to retry the origin, fall back to another
//! candidate, and whether to track a cooldown against the candidate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers.
#[derive(Debug)]
pub struct AppError(anyhow::Error, StatusCode);

impl AppError {
    pub fn with_status(err: impl Into<anyhow::Error>, status: StatusCode) -> Self {
        Self(err.into(), status)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, status = %self.1, "handler error");
        (
            self.1,
            Json(json!({
                "type": "error",
                "error": { "type": "internal_error", "message": self.0.to_string() }
            })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into(), StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Classification of a completed upstream attempt.
///
/// Drives three independent decisions in the balancer/handler: whether to
/// retry the same candidate, whether fallback to the next candidate is
/// permitted, and whether the candidate's cooldown/circuit state should be
/// updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Ok,
    InvalidRequest,
    ClientError,
    NotSupportedError,
    RateLimited,
    ServerError,
    NetworkError,
}

impl FailureCategory {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=399 => FailureCategory::Ok,
            400 | 422 => FailureCategory::InvalidRequest,
            401 | 403 => FailureCategory::ClientError,
            404 => FailureCategory::NotSupportedError,
            429 => FailureCategory::RateLimited,
            _ => FailureCategory::ServerError,
        }
    }

    pub fn network_error() -> Self {
        FailureCategory::NetworkError
    }

    pub fn retry_origin(self) -> bool {
        matches!(self, FailureCategory::ServerError | FailureCategory::NetworkError)
    }

    pub fn allow_fallback(self) -> bool {
        !matches!(self, FailureCategory::Ok | FailureCategory::InvalidRequest)
    }

    pub fn track_cooldown(self) -> bool {
        matches!(
            self,
            FailureCategory::RateLimited | FailureCategory::ServerError | FailureCategory::NetworkError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::Ok => "ok",
            FailureCategory::InvalidRequest => "invalid_request",
            FailureCategory::ClientError => "client_error",
            FailureCategory::NotSupportedError => "not_supported_error",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::ServerError => "server_error",
            FailureCategory::NetworkError => "network_error",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
