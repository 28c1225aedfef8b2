//! Gateway error taxonomy and its single mapping to HTTP responses.
//!
//! Every pipeline stage returns a typed outcome; only [`GatewayError`] turns
//! those into responses, so every denial path has the same JSON shape:
//!
//! ```json
//! {"success": false, "error": {"message": "...", "code": "...", "details": {...}}}
//! ```

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::http::request::ParseError;
use crate::http::response::apply_cors;
use crate::relay::FetchError;
use crate::security::SecurityVerdict;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    ClientInput(#[from] ParseError),

    #[error("User-Agent header is required")]
    MissingUserAgent,

    #[error("request denied: {reason}")]
    SecurityDenial { reason: String, rule: String },

    #[error("rate limit exceeded for this client and target")]
    RateLimited { retry_after: Duration },

    #[error("too many concurrent streams")]
    CapacityExceeded,

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Upstream(#[from] FetchError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Build a denial from a failed screening verdict.
    pub fn denied(verdict: &SecurityVerdict) -> Self {
        GatewayError::SecurityDenial {
            reason: verdict
                .reason
                .clone()
                .unwrap_or_else(|| "request denied".to_string()),
            rule: verdict
                .matched_rule
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ClientInput(_) | GatewayError::MissingUserAgent => StatusCode::BAD_REQUEST,
            GatewayError::SecurityDenial { .. } => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::Upstream(error) => error.status_code(),
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ClientInput(error) => error.code(),
            GatewayError::MissingUserAgent => "MISSING_USER_AGENT",
            GatewayError::SecurityDenial { .. } => "SECURITY_DENIED",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::CapacityExceeded => "CAPACITY_EXCEEDED",
            GatewayError::NotFound => "NOT_FOUND",
            GatewayError::Upstream(FetchError::Timeout(_)) => "UPSTREAM_TIMEOUT",
            GatewayError::Upstream(_) => "UPSTREAM_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Client-safe message. Internal failures never leak their cause.
    pub fn message(&self) -> String {
        match self {
            GatewayError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            GatewayError::SecurityDenial { rule, .. } => Some(json!({ "rule": rule })),
            GatewayError::RateLimited { retry_after } => {
                Some(json!({ "retry_after_secs": retry_after_secs(*retry_after) }))
            }
            GatewayError::Upstream(FetchError::Status(status)) => {
                Some(json!({ "upstream_status": status }))
            }
            GatewayError::Upstream(error) => Some(json!({ "kind": error.code() })),
            _ => None,
        }
    }
}

/// Whole seconds, rounded up so a client never retries early.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorPayload,
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    message: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            success: false,
            error: ErrorPayload {
                message: self.message(),
                code: self.code(),
                details: self.details(),
            },
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        apply_cors(headers);
        if let GatewayError::RateLimited { retry_after } = &self {
            headers.insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs(*retry_after)),
            );
        }
        response
    }
}
