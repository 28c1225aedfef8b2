//! Structured lifecycle events.

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::Method;
use serde::Serialize;
use serde_json::Value;

use crate::http::request::StreamRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Completed,
    Failed,
    Suspicious,
    Sampled,
    LargeTransfer,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Suspicious => "suspicious",
            EventKind::Sampled => "sampled",
            EventKind::LargeTransfer => "large_transfer",
        }
    }
}

/// The request fields every event carries. Owned so it can outlive the handler
/// and travel with the relay body.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub target_url: String,
    pub client_ip: IpAddr,
    pub received_at: SystemTime,
}

impl RequestContext {
    pub fn from_request(request: &StreamRequest) -> Self {
        Self {
            request_id: request.request_id.clone(),
            method: request.method.clone(),
            target_url: request.target_url.clone(),
            client_ip: request.client_ip,
            received_at: request.received_at,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed().unwrap_or_default()
    }
}

/// Write-once record handed to an [`super::sink::EventSink`].
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent {
    pub kind: EventKind,
    pub request_id: String,
    pub target_url: String,
    pub client_ip: IpAddr,
    pub duration_ms: u64,
    pub bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl ObservabilityEvent {
    pub fn new(kind: EventKind, context: &RequestContext) -> Self {
        Self {
            kind,
            request_id: context.request_id.clone(),
            target_url: context.target_url.clone(),
            client_ip: context.client_ip,
            duration_ms: context.elapsed().as_millis() as u64,
            bytes_transferred: 0,
            status_code: None,
            details: Value::Null,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_transfer(mut self, bytes: u64, duration: Duration) -> Self {
        self.bytes_transferred = bytes;
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::Ipv4Addr;

    #[test]
    fn serializes_with_snake_case_kind() {
        let context = RequestContext {
            request_id: "req-9".into(),
            method: Method::GET,
            target_url: "https://cdn.example.com/v.mp4".into(),
            client_ip: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4)),
            received_at: SystemTime::now(),
        };
        let event = ObservabilityEvent::new(EventKind::LargeTransfer, &context)
            .with_status(200)
            .with_transfer(11 * 1024 * 1024, Duration::from_millis(1500))
            .with_details(json!({ "threshold": 10 }));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "large_transfer");
        assert_eq!(value["status_code"], 200);
        assert_eq!(value["duration_ms"], 1500);
        assert_eq!(value["client_ip"], "198.51.100.4");
        assert_eq!(value["details"]["threshold"], 10);
    }

    #[test]
    fn empty_details_are_omitted() {
        let context = RequestContext {
            request_id: "req-1".into(),
            method: Method::GET,
            target_url: String::new(),
            client_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            received_at: SystemTime::now(),
        };
        let value = serde_json::to_value(ObservabilityEvent::new(EventKind::Started, &context)).unwrap();
        assert!(value.get("details").is_none());
        assert!(value.get("status_code").is_none());
    }
}
