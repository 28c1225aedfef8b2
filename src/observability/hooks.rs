//! Lifecycle hooks invoked by the gateway at fixed state transitions.
//!
//! The observer only records; it never changes what the pipeline does.

use std::sync::Arc;

use serde_json::json;

use crate::config::ObservabilityConfig;
use crate::error::GatewayError;
use crate::relay::{FetchError, SessionSnapshot, StreamOutcome};
use crate::security::SecurityVerdict;

use super::events::{EventKind, ObservabilityEvent, RequestContext};
use super::metrics;
use super::sampling::Sampler;
use super::sink::EventSink;

pub struct RequestObserver {
    sink: Arc<dyn EventSink>,
    sampler: Sampler,
    large_transfer_bytes: u64,
}

impl RequestObserver {
    pub fn new(sink: Arc<dyn EventSink>, config: &ObservabilityConfig) -> Self {
        Self {
            sink,
            sampler: Sampler::new(config.sampling_rate),
            large_transfer_bytes: config.large_transfer_bytes,
        }
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// A screening rule matched. Emitted whether or not the request is denied.
    pub fn on_suspicious(
        &self,
        context: &RequestContext,
        stage: &'static str,
        verdict: &SecurityVerdict,
        denied: bool,
    ) {
        self.sink.emit(
            ObservabilityEvent::new(EventKind::Suspicious, context).with_details(json!({
                "stage": stage,
                "rule": verdict.matched_rule,
                "reason": verdict.reason,
                "denied": denied,
            })),
        );
    }

    /// The pipeline stopped before the relay began.
    pub fn on_rejected(&self, context: &RequestContext, stage: &'static str, error: &GatewayError) {
        let status = error.status().as_u16();
        let rule = match error {
            GatewayError::SecurityDenial { rule, .. } => rule.as_str(),
            other => other.code(),
        };
        metrics::record_request("denied", status);
        metrics::record_denial(stage, rule);
        tracing::info!(
            request_id = %context.request_id,
            client_ip = %context.client_ip,
            stage,
            rule,
            status,
            "Request denied"
        );
    }

    /// The relay is about to contact the upstream.
    pub fn on_start(&self, context: &RequestContext) {
        metrics::record_stream_started();
        self.sink
            .emit(ObservabilityEvent::new(EventKind::Started, context));
        if self.sampler.should_sample() {
            self.sink.emit(
                ObservabilityEvent::new(EventKind::Sampled, context)
                    .with_details(json!({ "rate": self.sampler.rate() })),
            );
        }
    }

    pub fn on_complete(&self, context: &RequestContext, status: u16, snapshot: &SessionSnapshot) {
        metrics::record_request("completed", status);
        metrics::record_stream_finished(snapshot.bytes_transferred, snapshot.duration);
        self.sink.emit(
            ObservabilityEvent::new(EventKind::Completed, context)
                .with_status(status)
                .with_transfer(snapshot.bytes_transferred, snapshot.duration)
                .with_details(json!({ "chunks": snapshot.chunk_count })),
        );

        if snapshot.bytes_transferred > self.large_transfer_bytes {
            tracing::warn!(
                request_id = %context.request_id,
                target_url = %context.target_url,
                bytes = snapshot.bytes_transferred,
                threshold = self.large_transfer_bytes,
                "Large transfer"
            );
            self.sink.emit(
                ObservabilityEvent::new(EventKind::LargeTransfer, context)
                    .with_status(status)
                    .with_transfer(snapshot.bytes_transferred, snapshot.duration)
                    .with_details(json!({ "threshold": self.large_transfer_bytes })),
            );
        }
    }

    pub fn on_fail(
        &self,
        context: &RequestContext,
        status: u16,
        snapshot: &SessionSnapshot,
        error: &FetchError,
    ) {
        self.record_failure(context, "failed", status, snapshot, json!({
            "error": error.to_string(),
            "kind": error.code(),
        }));
    }

    /// The client disconnected before the body finished.
    pub fn on_abort(&self, context: &RequestContext, status: u16, snapshot: &SessionSnapshot) {
        self.record_failure(context, "aborted", status, snapshot, json!({
            "error": "client disconnected",
            "kind": "CLIENT_ABORTED",
        }));
    }

    /// Route a relay outcome to the matching hook.
    pub fn on_finish(
        &self,
        context: &RequestContext,
        status: u16,
        outcome: &StreamOutcome,
        snapshot: &SessionSnapshot,
    ) {
        match outcome {
            StreamOutcome::Completed => self.on_complete(context, status, snapshot),
            StreamOutcome::Failed(error) => self.on_fail(context, status, snapshot, error),
            StreamOutcome::Aborted => self.on_abort(context, status, snapshot),
        }
    }

    fn record_failure(
        &self,
        context: &RequestContext,
        outcome: &'static str,
        status: u16,
        snapshot: &SessionSnapshot,
        details: serde_json::Value,
    ) {
        metrics::record_request(outcome, status);
        metrics::record_stream_finished(snapshot.bytes_transferred, snapshot.duration);
        self.sink.emit(
            ObservabilityEvent::new(EventKind::Failed, context)
                .with_status(status)
                .with_transfer(snapshot.bytes_transferred, snapshot.duration)
                .with_details(details),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::sink::MemorySink;
    use axum::http::Method;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, SystemTime};

    fn context() -> RequestContext {
        RequestContext {
            request_id: "req-7".into(),
            method: Method::GET,
            target_url: "https://cdn.example.com/v.mp4".into(),
            client_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 2)),
            received_at: SystemTime::now(),
        }
    }

    fn observer(sampling_rate: f64) -> (RequestObserver, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let config = ObservabilityConfig {
            sampling_rate,
            large_transfer_bytes: 1_000,
            ..ObservabilityConfig::default()
        };
        (RequestObserver::new(sink.clone(), &config), sink)
    }

    fn snapshot(bytes: u64) -> SessionSnapshot {
        SessionSnapshot {
            bytes_transferred: bytes,
            chunk_count: 1,
            duration: Duration::from_millis(20),
            last_error: None,
        }
    }

    #[test]
    fn start_is_sampled_at_full_rate() {
        let (observer, sink) = observer(1.0);
        observer.on_start(&context());
        assert_eq!(sink.kinds(), vec![EventKind::Started, EventKind::Sampled]);
    }

    #[test]
    fn start_is_not_sampled_at_zero_rate() {
        let (observer, sink) = observer(0.0);
        observer.on_start(&context());
        assert_eq!(sink.kinds(), vec![EventKind::Started]);
    }

    #[test]
    fn large_completion_emits_an_extra_event() {
        let (observer, sink) = observer(0.0);
        observer.on_complete(&context(), 200, &snapshot(999));
        observer.on_complete(&context(), 200, &snapshot(1_001));

        let large = sink.of_kind(EventKind::LargeTransfer);
        assert_eq!(large.len(), 1);
        assert_eq!(large[0].bytes_transferred, 1_001);
        assert_eq!(sink.of_kind(EventKind::Completed).len(), 2);
    }

    #[test]
    fn abort_and_failure_are_failed_events() {
        let (observer, sink) = observer(0.0);
        observer.on_finish(&context(), 200, &StreamOutcome::Aborted, &snapshot(10));
        observer.on_finish(
            &context(),
            504,
            &StreamOutcome::Failed(FetchError::Timeout("idle".into())),
            &snapshot(0),
        );

        let failed = sink.of_kind(EventKind::Failed);
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].details["kind"], "CLIENT_ABORTED");
        assert_eq!(failed[1].details["kind"], "UPSTREAM_TIMEOUT");
        assert_eq!(failed[1].status_code, Some(504));
    }

    #[test]
    fn suspicious_records_the_rule() {
        let (observer, sink) = observer(0.0);
        let verdict = SecurityVerdict::deny("scheme.javascript", "matched scheme.javascript");
        observer.on_suspicious(&context(), "pattern", &verdict, true);

        let events = sink.of_kind(EventKind::Suspicious);
        assert_eq!(events[0].details["rule"], "scheme.javascript");
        assert_eq!(events[0].details["denied"], true);
    }
}
