//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Gateway state transitions:
//!     → hooks.rs (on_start, on_complete, on_fail, on_suspicious, on_rejected)
//!     → events.rs (write-once ObservabilityEvent)
//!     → sink.rs (ChannelSink buffer → TracingSink / MemorySink)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Allowed requests:
//!     → sampling.rs (random share tagged `sampled`)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON via logging.rs)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through every event
//! - Emitting never blocks the relay; a full buffer drops and counts

pub mod events;
pub mod hooks;
pub mod logging;
pub mod metrics;
pub mod sampling;
pub mod sink;

pub use events::{EventKind, ObservabilityEvent, RequestContext};
pub use hooks::RequestObserver;
pub use sink::{ChannelSink, EventSink, MemorySink, TracingSink};
