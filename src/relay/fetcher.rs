//! Upstream fetcher abstraction and the reqwest-backed implementation.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method, StatusCode};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use url::Url;

use crate::config::UpstreamConfig;
use crate::security::resolve::{GuardedResolver, ResolveError};
use crate::security::ssrf::SsrfGuard;

/// Upstream body as a stream of chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Why the upstream could not deliver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("upstream connection failed: {0}")]
    Connect(String),
    #[error("upstream timed out: {0}")]
    Timeout(String),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("upstream sent invalid headers: {0}")]
    InvalidHeaders(String),
    #[error("upstream body failed: {0}")]
    Body(String),
    #[error("upstream resource exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error("upstream target refused: {0}")]
    Refused(String),
}

impl FetchError {
    /// Client-facing status for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            FetchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FetchError::Timeout(_) => "UPSTREAM_TIMEOUT",
            FetchError::TooLarge { .. } => "UPSTREAM_TOO_LARGE",
            FetchError::Refused(_) => "UPSTREAM_REFUSED",
            _ => "UPSTREAM_ERROR",
        }
    }

    fn from_reqwest(error: &reqwest::Error) -> Self {
        if let Some(resolve) = find_source::<ResolveError>(error) {
            return FetchError::Refused(resolve.to_string());
        }
        if let Some(refused) = find_source::<FetchError>(error) {
            return refused.clone();
        }
        if error.is_timeout() {
            FetchError::Timeout(error.to_string())
        } else if error.is_redirect() {
            FetchError::Refused(error.to_string())
        } else if error.is_body() || error.is_decode() {
            FetchError::Body(error.to_string())
        } else {
            FetchError::Connect(error.to_string())
        }
    }
}

fn find_source<'a, T: StdError + 'static>(error: &'a (dyn StdError + 'static)) -> Option<&'a T> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(found) = err.downcast_ref::<T>() {
            return Some(found);
        }
        current = err.source();
    }
    None
}

/// What the relay asks the upstream for.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    /// Forwarded verbatim.
    pub range: Option<String>,
    pub user_agent: Option<String>,
}

/// Upstream status, headers and a lazily pulled body.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Opens a connection to the origin. Dropping the returned body must close it.
pub trait UpstreamFetcher: Send + Sync {
    fn fetch(&self, request: UpstreamRequest) -> BoxFuture<'_, Result<UpstreamResponse, FetchError>>;
}

/// Production fetcher built on a pooled `reqwest::Client`.
pub struct ReqwestFetcher {
    client: reqwest::Client,
    response_timeout: Duration,
}

impl ReqwestFetcher {
    /// Build the client. Redirect hops are screened with `guard`; with
    /// `resolve_check` enabled, DNS answers are screened as well.
    pub fn new(config: &UpstreamConfig, guard: SsrfGuard) -> Result<Self, reqwest::Error> {
        let max_redirects = config.max_redirects;
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                return attempt.error(FetchError::Refused(format!(
                    "more than {max_redirects} redirects"
                )));
            }
            let verdict = guard.evaluate(attempt.url());
            match verdict.matched_rule {
                None => attempt.follow(),
                Some(rule) => {
                    attempt.error(FetchError::Refused(format!("redirect denied by {rule}")))
                }
            }
        });

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .redirect(policy)
            .tcp_nodelay(true)
            .pool_max_idle_per_host(16)
            .no_proxy();
        if config.resolve_check {
            builder = builder.dns_resolver(Arc::new(GuardedResolver));
        }

        Ok(Self {
            client: builder.build()?,
            response_timeout: Duration::from_secs(config.response_timeout_secs),
        })
    }
}

impl UpstreamFetcher for ReqwestFetcher {
    fn fetch(&self, request: UpstreamRequest) -> BoxFuture<'_, Result<UpstreamResponse, FetchError>> {
        Box::pin(async move {
            let mut builder = self.client.request(request.method, request.url);
            if let Some(range) = &request.range {
                builder = builder.header(header::RANGE, range.as_str());
            }
            if let Some(user_agent) = &request.user_agent {
                builder = builder.header(header::USER_AGENT, user_agent.as_str());
            }

            let response = tokio::time::timeout(self.response_timeout, builder.send())
                .await
                .map_err(|_| {
                    FetchError::Timeout(format!(
                        "no response headers within {}s",
                        self.response_timeout.as_secs()
                    ))
                })?
                .map_err(|e| FetchError::from_reqwest(&e))?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes_stream()
                .map_err(|e| FetchError::from_reqwest(&e))
                .boxed();

            Ok(UpstreamResponse {
                status,
                headers,
                body,
            })
        })
    }
}
