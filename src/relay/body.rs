//! The client-facing relay body.
//!
//! [`RelayStream`] wraps the upstream byte stream and is handed to hyper as the
//! response body. Hyper only polls it when the client socket can take more data,
//! so a slow client stops upstream reads instead of growing a buffer. Dropping
//! the body (client gone) drops the upstream stream, which closes its connection.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{Instant, Sleep};

use super::fetcher::{ByteStream, FetchError};
use super::session::{SessionSnapshot, StreamSession};

/// How a relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Upstream reached end of body and every byte was handed to the client.
    Completed,
    /// Upstream failed, stalled, or exceeded the size limit.
    Failed(FetchError),
    /// The client went away before the body finished.
    Aborted,
}

/// Called exactly once when the relay ends, however it ends.
pub type FinishHook = Box<dyn FnOnce(StreamOutcome, SessionSnapshot) + Send + 'static>;

pub struct RelayStream {
    upstream: Option<ByteStream>,
    session: StreamSession,
    idle_timeout: Duration,
    idle: Pin<Box<Sleep>>,
    waiting: bool,
    max_bytes: u64,
    on_finish: Option<FinishHook>,
    permit: Option<OwnedSemaphorePermit>,
}

impl RelayStream {
    /// `max_bytes == 0` disables the size limit.
    pub fn new(
        upstream: ByteStream,
        idle_timeout: Duration,
        max_bytes: u64,
        permit: Option<OwnedSemaphorePermit>,
        on_finish: FinishHook,
    ) -> Self {
        Self {
            upstream: Some(upstream),
            session: StreamSession::start(),
            idle_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
            waiting: false,
            max_bytes,
            on_finish: Some(on_finish),
            permit,
        }
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        // Close upstream and free the capacity slot before reporting.
        self.upstream = None;
        self.permit = None;
        if let StreamOutcome::Failed(error) = &outcome {
            self.session.record_error(error.clone());
        }
        if let Some(hook) = self.on_finish.take() {
            hook(outcome, self.session.snapshot());
        }
    }

    fn fail(&mut self, error: FetchError) -> Poll<Option<Result<Bytes, FetchError>>> {
        self.finish(StreamOutcome::Failed(error.clone()));
        Poll::Ready(Some(Err(error)))
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, FetchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(upstream) = this.upstream.as_mut() else {
            return Poll::Ready(None);
        };

        match upstream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.waiting = false;
                let total = this
                    .session
                    .bytes_transferred()
                    .saturating_add(chunk.len() as u64);
                if this.max_bytes > 0 && total > this.max_bytes {
                    return this.fail(FetchError::TooLarge {
                        limit: this.max_bytes,
                    });
                }
                this.session.record_chunk(chunk.len());
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => this.fail(error),
            Poll::Ready(None) => {
                this.finish(StreamOutcome::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => {
                // The idle clock starts when upstream first has nothing to give.
                if !this.waiting {
                    this.waiting = true;
                    let deadline = Instant::now() + this.idle_timeout;
                    this.idle.as_mut().reset(deadline);
                }
                if this.idle.as_mut().poll(cx).is_ready() {
                    let secs = this.idle_timeout.as_secs_f64();
                    return this.fail(FetchError::Timeout(format!(
                        "upstream stalled for {secs:.1}s"
                    )));
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if self.on_finish.is_some() {
            self.finish(StreamOutcome::Aborted);
        }
    }
}
