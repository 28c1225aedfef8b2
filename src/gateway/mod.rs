//! Gateway orchestration subsystem.
//!
//! # Data Flow
//! ```text
//! StreamRequest (from http/request.rs)
//!     → pipeline.rs (fixed stage order, typed rejections)
//!     → state.rs (Received → … → Completed | Failed | Denied)
//!     → relay (only after every stage passed)
//!     → observability hooks at each transition
//! ```
//!
//! # Design Decisions
//! - The pipeline is the single place errors become HTTP responses
//! - No retries: terminal states are final, the player re-requests
//! - The security policy is read once per request from an atomic snapshot

pub mod pipeline;
pub mod state;

pub use pipeline::Gateway;
pub use state::{RequestState, StateMachine};
