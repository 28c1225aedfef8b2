//! Stream relay subsystem.
//!
//! # Data Flow
//! ```text
//! Screened request:
//!     → fetcher.rs (open upstream, forward Range verbatim)
//!     → mod.rs (status check, header validation, client header set)
//!     → body.rs (pull-driven relay body with idle timeout and size cap)
//!     → session.rs (bytes and chunk accounting, final snapshot)
//! ```
//!
//! # Design Decisions
//! - The body is never buffered; hyper pulls chunks as the client drains them
//! - Client disconnect drops the body, which drops the upstream connection
//! - No retries once a response has started

pub mod body;
pub mod fetcher;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use tokio::sync::OwnedSemaphorePermit;

use crate::config::UpstreamConfig;
use crate::http::request::{ParsedTarget, StreamRequest};
use crate::http::response::apply_cors;

pub use body::{FinishHook, RelayStream, StreamOutcome};
pub use fetcher::{ByteStream, FetchError, ReqwestFetcher, UpstreamFetcher, UpstreamRequest, UpstreamResponse};
pub use session::{SessionSnapshot, StreamSession};

/// Headers copied from upstream to the client when present.
const MIRRORED_HEADERS: [header::HeaderName; 6] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ETAG,
    header::LAST_MODIFIED,
    header::CACHE_CONTROL,
];

/// An upstream response accepted for relaying, body not yet pulled.
pub struct OpenedStream {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for OpenedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedStream")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Opens upstream fetches and wraps their bodies for the client.
pub struct Relay {
    fetcher: Arc<dyn UpstreamFetcher>,
    idle_timeout: Duration,
    max_stream_bytes: u64,
    user_agent: Option<String>,
}

impl Relay {
    pub fn new(fetcher: Arc<dyn UpstreamFetcher>, config: &UpstreamConfig) -> Self {
        Self {
            fetcher,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            max_stream_bytes: config.max_stream_bytes,
            user_agent: config.user_agent.clone(),
        }
    }

    /// Fetch the target and decide whether its response can be relayed.
    pub async fn open(
        &self,
        request: &StreamRequest,
        target: &ParsedTarget,
    ) -> Result<OpenedStream, FetchError> {
        let method = if request.method == Method::HEAD {
            Method::HEAD
        } else {
            Method::GET
        };
        let upstream = self
            .fetcher
            .fetch(UpstreamRequest {
                method,
                url: target.url.clone(),
                range: target.range.and(request.range_header.clone()),
                user_agent: self.user_agent.clone().or_else(|| request.user_agent.clone()),
            })
            .await?;

        if !(upstream.status.is_success() || upstream.status.is_redirection()) {
            return Err(FetchError::Status(upstream.status.as_u16()));
        }

        let content_length = match upstream.headers.get(header::CONTENT_LENGTH) {
            None => None,
            Some(value) => Some(
                value
                    .to_str()
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or_else(|| {
                        FetchError::InvalidHeaders(format!("content-length {value:?}"))
                    })?,
            ),
        };
        if let Some(len) = content_length {
            if self.max_stream_bytes > 0 && len > self.max_stream_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.max_stream_bytes,
                });
            }
        }
        if upstream.status == StatusCode::PARTIAL_CONTENT
            && !upstream.headers.contains_key(header::CONTENT_RANGE)
        {
            return Err(FetchError::InvalidHeaders(
                "206 response without content-range".to_string(),
            ));
        }

        Ok(OpenedStream {
            status: upstream.status,
            headers: client_headers(&upstream.headers),
            content_length,
            body: upstream.body,
        })
    }

    /// Wrap an opened body for the client.
    pub fn stream(
        &self,
        body: ByteStream,
        permit: Option<OwnedSemaphorePermit>,
        on_finish: FinishHook,
    ) -> RelayStream {
        RelayStream::new(
            body,
            self.idle_timeout,
            self.max_stream_bytes,
            permit,
            on_finish,
        )
    }
}

/// The header set sent to the client: mirrored upstream headers, byte-range
/// support and CORS.
pub fn client_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in MIRRORED_HEADERS {
        if let Some(value) = upstream.get(&name) {
            headers.insert(name, value.clone());
        }
    }
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    apply_cors(&mut headers);
    headers
}
