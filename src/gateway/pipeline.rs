//! The fixed-order request pipeline.
//!
//! # Stages
//! ```text
//! parse → user-agent presence → SSRF guard → attack patterns → referrer
//!       → user-agent policy → capacity → rate limit → relay
//! ```
//! Each stage either passes or ends the request with a typed error. Only the
//! relay performs I/O, and it only runs once every earlier stage has passed.

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::Semaphore;

use crate::config::{GatewayConfig, SecurityConfig};
use crate::error::GatewayError;
use crate::http::request::{parse, ParsedTarget, StreamRequest};
use crate::observability::{EventSink, RequestContext, RequestObserver};
use crate::relay::{
    FinishHook, Relay, SessionSnapshot, StreamOutcome, StreamSession, UpstreamFetcher,
};
use crate::security::rate_limit::{RateDecision, RateLimitKey, RateLimitStore, RateLimiter};
use crate::security::user_agent::AUTOMATED_RULE;
use crate::security::{SecurityPolicy, SecurityVerdict};

use super::state::{RequestState, StateMachine};

/// Pipeline stage names used in denial events and metrics.
pub mod stages {
    pub const PARSE: &str = "parse";
    pub const SSRF: &str = "ssrf";
    pub const PATTERN: &str = "pattern";
    pub const REFERRER: &str = "referrer";
    pub const USER_AGENT: &str = "user_agent";
    pub const RATE_LIMIT: &str = "rate_limit";
    pub const CAPACITY: &str = "capacity";
    pub const RELAY: &str = "relay";
    pub const INTERNAL: &str = "internal";
}

struct Rejection {
    stage: &'static str,
    error: GatewayError,
}

impl Rejection {
    fn new(stage: &'static str, error: impl Into<GatewayError>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }
}

/// Composes parsing, screening, rate limiting and relaying.
pub struct Gateway {
    policy: Arc<ArcSwap<SecurityPolicy>>,
    limiter: Arc<RateLimiter>,
    relay: Relay,
    observer: Arc<RequestObserver>,
    streams: Arc<Semaphore>,
}

impl Gateway {
    /// Fails only if the configured rule set does not compile.
    pub fn new(
        config: &GatewayConfig,
        fetcher: Arc<dyn UpstreamFetcher>,
        store: Arc<dyn RateLimitStore>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, regex::Error> {
        let policy = SecurityPolicy::from_config(&config.security)?;
        Ok(Self {
            policy: Arc::new(ArcSwap::from_pointee(policy)),
            limiter: Arc::new(RateLimiter::new(&config.rate_limit, store)),
            relay: Relay::new(fetcher, &config.upstream),
            observer: Arc::new(RequestObserver::new(sink, &config.observability)),
            streams: Arc::new(Semaphore::new(config.listener.max_concurrent_streams)),
        })
    }

    /// Shared handle to the live policy.
    pub fn policy_handle(&self) -> Arc<ArcSwap<SecurityPolicy>> {
        self.policy.clone()
    }

    /// Compile and atomically install a new security policy. The old policy
    /// stays in place when compilation fails.
    pub fn reload_policy(&self, config: &SecurityConfig) -> Result<(), regex::Error> {
        let policy = SecurityPolicy::from_config(config)?;
        tracing::info!(
            rules = policy.detector.len(),
            rule_set = %policy.detector.version(),
            "Security policy reloaded"
        );
        self.policy.store(Arc::new(policy));
        Ok(())
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Relays currently holding a capacity slot.
    pub fn available_streams(&self) -> usize {
        self.streams.available_permits()
    }

    /// Run one request through every stage and produce the client response.
    pub async fn handle(&self, request: StreamRequest) -> Response {
        let context = RequestContext::from_request(&request);
        let mut machine = StateMachine::new(context.request_id.clone());

        match self.run(&request, &context, &mut machine).await {
            Ok(response) => response,
            Err(rejection) => self.reject(&context, &mut machine, rejection),
        }
    }

    async fn run(
        &self,
        request: &StreamRequest,
        context: &RequestContext,
        machine: &mut StateMachine,
    ) -> Result<Response, Rejection> {
        let policy = self.policy.load_full();

        // Received → Parsed
        let target = match parse(&request.target_url, request.range_header.as_deref()) {
            Ok(target) => target,
            Err(error) => {
                // Payloads that do not even parse still deserve an audit trail.
                if !request.target_url.trim().is_empty() {
                    let verdict = policy.detector.scan(&request.target_url);
                    if verdict.is_denied() {
                        self.observer
                            .on_suspicious(context, stages::PATTERN, &verdict, true);
                    }
                }
                return Err(Rejection::new(stages::PARSE, error));
            }
        };
        let user_agent = request
            .user_agent
            .as_deref()
            .map(str::trim)
            .filter(|ua| !ua.is_empty())
            .ok_or_else(|| Rejection::new(stages::PARSE, GatewayError::MissingUserAgent))?;
        advance(machine, RequestState::Parsed)?;

        // Parsed → SecurityChecked
        self.screen(&policy, request, &target, context)?;
        advance(machine, RequestState::SecurityChecked)?;

        // SecurityChecked → RateChecked
        if let Some(signature) = policy.user_agent.automated_signature(user_agent) {
            let verdict = SecurityVerdict::deny(
                AUTOMATED_RULE,
                format!("automated client signature '{signature}'"),
            );
            let blocked = policy.user_agent.blocks();
            self.observer
                .on_suspicious(context, stages::USER_AGENT, &verdict, blocked);
            if blocked {
                return Err(Rejection::new(
                    stages::USER_AGENT,
                    GatewayError::denied(&verdict),
                ));
            }
        }

        // A request turned away for capacity must not spend rate budget.
        let permit = self
            .streams
            .clone()
            .try_acquire_owned()
            .map_err(|_| Rejection::new(stages::CAPACITY, GatewayError::CapacityExceeded))?;
        let decision = self
            .limiter
            .check_and_increment(&RateLimitKey::new(request.client_ip, target.url.as_str()));
        if !decision.allowed {
            return Err(Rejection::new(
                stages::RATE_LIMIT,
                GatewayError::RateLimited {
                    retry_after: decision.reset_after,
                },
            ));
        }
        advance(machine, RequestState::RateChecked)?;

        // RateChecked → Streaming
        advance(machine, RequestState::Streaming)?;
        self.observer.on_start(context);

        let session = StreamSession::start();
        let opened = self
            .relay
            .open(request, &target)
            .await
            .map_err(|error| Rejection::new(stages::RELAY, error))?;
        let status = opened.status;
        let mut headers = opened.headers;
        rate_limit_headers(&mut headers, &decision);

        let body = if request.method == Method::HEAD {
            drop(opened.body);
            drop(permit);
            advance(machine, RequestState::Completed)?;
            self.observer
                .on_complete(context, status.as_u16(), &session.snapshot());
            Body::empty()
        } else {
            let hook = self.finish_hook(context.clone(), machine.clone(), status);
            Body::from_stream(self.relay.stream(opened.body, Some(permit), hook))
        };

        tracing::debug!(
            request_id = %context.request_id,
            status = status.as_u16(),
            content_length = ?opened.content_length,
            "Relaying upstream response"
        );

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    /// SSRF, attack patterns and referrer, in that order.
    fn screen(
        &self,
        policy: &SecurityPolicy,
        request: &StreamRequest,
        target: &ParsedTarget,
        context: &RequestContext,
    ) -> Result<(), Rejection> {
        let deny = |stage: &'static str, verdict: SecurityVerdict| -> Result<(), Rejection> {
            self.observer.on_suspicious(context, stage, &verdict, true);
            Err(Rejection::new(stage, GatewayError::denied(&verdict)))
        };

        let verdict = policy.ssrf.evaluate(&target.url);
        if verdict.is_denied() {
            return deny(stages::SSRF, verdict);
        }

        // The raw target keeps `../` and encodings that URL normalization removes.
        let verdict = policy.detector.scan(&request.target_url);
        if verdict.is_denied() {
            return deny(stages::PATTERN, verdict);
        }
        if let Some(referrer) = request.referrer.as_deref() {
            let verdict = policy.detector.scan(referrer);
            if verdict.is_denied() {
                return deny(stages::PATTERN, verdict);
            }
        }

        let verdict = policy
            .referrer
            .check(&target.url, request.referrer.as_deref());
        if verdict.is_denied() {
            return deny(stages::REFERRER, verdict);
        }

        Ok(())
    }

    fn finish_hook(
        &self,
        context: RequestContext,
        mut machine: StateMachine,
        status: StatusCode,
    ) -> FinishHook {
        let observer = self.observer.clone();
        Box::new(move |outcome: StreamOutcome, snapshot: SessionSnapshot| {
            let terminal = match outcome {
                StreamOutcome::Completed => RequestState::Completed,
                _ => RequestState::Failed,
            };
            if let Err(error) = machine.advance(terminal) {
                tracing::error!(request_id = %context.request_id, error = %error, "Relay finished in unexpected state");
            }
            observer.on_finish(&context, status.as_u16(), &outcome, &snapshot);
        })
    }

    fn reject(
        &self,
        context: &RequestContext,
        machine: &mut StateMachine,
        rejection: Rejection,
    ) -> Response {
        let Rejection { stage, error } = rejection;
        match &error {
            GatewayError::Upstream(fetch) => {
                settle(context, machine, RequestState::Failed);
                tracing::warn!(
                    request_id = %context.request_id,
                    target_url = %context.target_url,
                    error = %fetch,
                    "Upstream fetch failed"
                );
                self.observer.on_fail(
                    context,
                    error.status().as_u16(),
                    &SessionSnapshot {
                        bytes_transferred: 0,
                        chunk_count: 0,
                        duration: context.elapsed(),
                        last_error: Some(fetch.clone()),
                    },
                    fetch,
                );
            }
            GatewayError::Internal(message) => {
                tracing::error!(request_id = %context.request_id, error = %message, "Internal gateway error");
                self.observer.on_rejected(context, stage, &error);
            }
            _ => {
                settle(context, machine, RequestState::Denied);
                self.observer.on_rejected(context, stage, &error);
            }
        }
        error.into_response()
    }
}

fn advance(machine: &mut StateMachine, next: RequestState) -> Result<(), Rejection> {
    machine
        .advance(next)
        .map_err(|e| Rejection::new(stages::INTERNAL, GatewayError::Internal(e.to_string())))
}

/// Moves a rejected request to its terminal state, logging a refused transition.
fn settle(context: &RequestContext, machine: &mut StateMachine, terminal: RequestState) {
    if let Err(error) = machine.advance(terminal) {
        tracing::error!(
            request_id = %context.request_id,
            error = %error,
            "Rejected request could not reach its terminal state"
        );
    }
}

fn rate_limit_headers(headers: &mut axum::http::HeaderMap, decision: &RateDecision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
}
