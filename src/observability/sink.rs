//! Event sinks.
//!
//! # Design Decisions
//! - `emit` never blocks and never fails; a sink that cannot keep up drops
//!   events and counts them instead of slowing the relay
//! - [`ChannelSink`] puts a bounded buffer and a background task in front of
//!   any other sink

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::events::{EventKind, ObservabilityEvent};
use super::metrics;

/// Accepts lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ObservabilityEvent);
}

/// Renders events as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ObservabilityEvent) {
        let status = event.status_code.unwrap_or_default();
        let details = if event.details.is_null() {
            String::new()
        } else {
            event.details.to_string()
        };

        match event.kind {
            EventKind::Suspicious | EventKind::LargeTransfer => tracing::warn!(
                target: "stream_gateway::events",
                kind = event.kind.as_str(),
                request_id = %event.request_id,
                target_url = %event.target_url,
                client_ip = %event.client_ip,
                status,
                bytes = event.bytes_transferred,
                duration_ms = event.duration_ms,
                details = %details,
                "Gateway event"
            ),
            EventKind::Failed => tracing::error!(
                target: "stream_gateway::events",
                kind = event.kind.as_str(),
                request_id = %event.request_id,
                target_url = %event.target_url,
                client_ip = %event.client_ip,
                status,
                bytes = event.bytes_transferred,
                duration_ms = event.duration_ms,
                details = %details,
                "Gateway event"
            ),
            _ => tracing::info!(
                target: "stream_gateway::events",
                kind = event.kind.as_str(),
                request_id = %event.request_id,
                target_url = %event.target_url,
                client_ip = %event.client_ip,
                status,
                bytes = event.bytes_transferred,
                duration_ms = event.duration_ms,
                details = %details,
                "Gateway event"
            ),
        }
    }
}

/// Keeps every event in memory. Intended for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ObservabilityEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservabilityEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<ObservabilityEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.kind == kind)
            .collect()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|event| event.kind).collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: ObservabilityEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

/// Buffers events in a bounded channel drained by a background task.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<ObservabilityEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Spawn the drain task forwarding into `inner`. The task ends once the
    /// sink is dropped and the buffer is empty.
    pub fn spawn(inner: Arc<dyn EventSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ObservabilityEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                inner.emit(event);
            }
            tracing::debug!("Event sink drained");
        });

        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            handle,
        )
    }

    /// Events lost because the buffer was full or the drain task had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ObservabilityEvent) {
        if let Err(error) = self.tx.try_send(event) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::record_event_dropped();
            if total.is_power_of_two() {
                tracing::warn!(dropped = total, error = %error, "Event buffer full, dropping events");
            }
        }
    }
}
