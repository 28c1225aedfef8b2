//! Per-relay transfer accounting.

use std::time::{Duration, Instant};

use super::fetcher::FetchError;

/// Live counters for one relay. Owned by the relay body, never shared.
#[derive(Debug)]
pub struct StreamSession {
    bytes_transferred: u64,
    chunk_count: u64,
    started_at: Instant,
    last_error: Option<FetchError>,
}

impl StreamSession {
    pub fn start() -> Self {
        Self {
            bytes_transferred: 0,
            chunk_count: 0,
            started_at: Instant::now(),
            last_error: None,
        }
    }

    /// Account for one chunk handed to the client.
    pub fn record_chunk(&mut self, len: usize) {
        self.bytes_transferred = self.bytes_transferred.saturating_add(len as u64);
        self.chunk_count += 1;
    }

    pub fn record_error(&mut self, error: FetchError) {
        self.last_error = Some(error);
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn last_error(&self) -> Option<&FetchError> {
        self.last_error.as_ref()
    }

    /// Final values handed to observability once the relay ends.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            bytes_transferred: self.bytes_transferred,
            chunk_count: self.chunk_count,
            duration: self.started_at.elapsed(),
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub bytes_transferred: u64,
    pub chunk_count: u64,
    pub duration: Duration,
    pub last_error: Option<FetchError>,
}
