//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, request ID and trace layers)
//!     → request.rs (StreamRequest extraction, URL & Range parsing)
//!     → gateway pipeline
//!     → response.rs (CORS headers, preflight)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{ParseError, ParsedRange, ParsedTarget, StreamRequest, X_REQUEST_ID};
pub use server::{AppState, HttpServer, ServerError};
