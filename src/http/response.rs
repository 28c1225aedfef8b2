//! Response helpers shared by the relay and the error path.
//!
//! # Responsibilities
//! - Attach the permissive CORS headers browser players need
//! - Answer CORS preflight without touching the pipeline
//!
//! # Design Decisions
//! - CORS is applied to every response from `/stream`, errors included,
//!   so a browser can read the JSON error body cross-origin

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

pub const ALLOW_ORIGIN: &str = "*";
pub const ALLOW_METHODS: &str = "GET, HEAD, OPTIONS";
pub const ALLOW_HEADERS: &str = "Range, Content-Type, Authorization, X-Requested-With";
pub const EXPOSE_HEADERS: &str = "Content-Length, Content-Range, Accept-Ranges";
pub const PREFLIGHT_MAX_AGE_SECS: u32 = 86_400;

/// Add the CORS response headers, replacing any present.
pub fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(ALLOW_ORIGIN),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSE_HEADERS),
    );
}

/// `OPTIONS /stream`: 204 with CORS headers and a one day max-age.
pub fn preflight() -> Response {
    let mut headers = HeaderMap::new();
    apply_cors(&mut headers);
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from(PREFLIGHT_MAX_AGE_SECS),
    );
    (StatusCode::NO_CONTENT, headers).into_response()
}
