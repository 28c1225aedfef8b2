//! Request state machine.
//!
//! # States
//! - Received: HTTP request accepted, nothing checked
//! - Parsed: target URL and Range are well-formed
//! - SecurityChecked: SSRF, pattern and referrer checks passed
//! - RateChecked: within budget and capacity
//! - Streaming: upstream contacted, body relaying
//! - Completed / Failed / Denied: terminal
//!
//! # State Transitions
//! ```text
//! Received → Parsed → SecurityChecked → RateChecked → Streaming → Completed
//!                                                              → Failed
//! Received | Parsed | SecurityChecked | RateChecked → Denied
//! ```

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Received,
    Parsed,
    SecurityChecked,
    RateChecked,
    Streaming,
    Completed,
    Failed,
    Denied,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Denied
        )
    }

    pub fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;

        matches!(
            (self, next),
            (Received, Parsed)
                | (Parsed, SecurityChecked)
                | (SecurityChecked, RateChecked)
                | (RateChecked, Streaming)
                | (Streaming, Completed)
                | (Streaming, Failed)
                | (Received | Parsed | SecurityChecked | RateChecked, Denied)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid request state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: RequestState,
    pub to: RequestState,
}

/// Tracks one request through the pipeline.
#[derive(Debug, Clone)]
pub struct StateMachine {
    request_id: String,
    state: RequestState,
}

impl StateMachine {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            state: RequestState::Received,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn advance(&mut self, next: RequestState) -> Result<(), InvalidTransition> {
        if !self.state.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(
            request_id = %self.request_id,
            from = ?self.state,
            to = ?next,
            "Request state transition"
        );
        self.state = next;
        Ok(())
    }
}
