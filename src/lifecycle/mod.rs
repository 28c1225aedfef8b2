//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!
//! Shutdown (shutdown.rs):
//!     Broadcast → server stops accepting, drains in-flight relays
//!               → config watcher task exits
//!               → rate-limit eviction task exits
//! ```
//!
//! # Design Decisions
//! - One broadcast channel, every long-running task subscribes
//! - In-flight streams finish or are cut when the process exits

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
