//! Message envelope exchanged between a queue handler and its backend.
//!
//! A [`QueueMessage`] carries the raw payload, its [`MessageContext`] and a
//! single-use outcome slot. Whoever ends up owning the envelope (the backend's
//! outgoing loop for a publish, the handler's consume loop for a receive)
//! resolves the slot exactly once; the resolving methods consume the
//! envelope, so resolving twice does not compile. Dropping an envelope
//! without resolving it reports [`QueueError::Abandoned`] to the waiter.

use crate::context::MessageContext;
use crate::error::QueueError;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

// ============================================================================
// Queue Message
// ============================================================================

/// A message travelling through a handler's in or out buffer.
#[derive(Debug)]
pub struct QueueMessage {
    /// Raw payload bytes
    pub data: Bytes,
    /// Propagation context bound to this message
    pub context: MessageContext,
    outcome: OutcomeSender,
}

impl QueueMessage {
    /// Create an envelope and the outcome future that observes it.
    pub fn new(data: Bytes, context: MessageContext) -> (Self, Outcome) {
        let (tx, rx) = oneshot::channel();
        let message = Self {
            data,
            context,
            outcome: OutcomeSender(tx),
        };
        (message, Outcome::pending(rx))
    }

    /// Report success to the waiting side.
    pub fn complete(self) {
        self.outcome.complete();
    }

    /// Report failure to the waiting side.
    pub fn fail(self, err: QueueError) {
        self.outcome.fail(err);
    }

    /// Report an already computed result to the waiting side.
    pub fn resolve(self, result: Result<(), QueueError>) {
        self.outcome.resolve(result);
    }

    /// Split the envelope so the payload can be moved while the outcome slot
    /// is resolved later.
    pub fn into_parts(self) -> (Bytes, MessageContext, OutcomeSender) {
        (self.data, self.context, self.outcome)
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Sending half of a message's outcome slot.
#[derive(Debug)]
pub struct OutcomeSender(oneshot::Sender<Result<(), QueueError>>);

impl OutcomeSender {
    pub fn complete(self) {
        self.resolve(Ok(()));
    }

    pub fn fail(self, err: QueueError) {
        self.resolve(Err(err));
    }

    pub fn resolve(self, result: Result<(), QueueError>) {
        // The waiter may have given up; nothing is left to notify then.
        let _ = self.0.send(result);
    }
}

/// Future resolving to the outcome of one publish or receive.
#[derive(Debug)]
pub struct Outcome {
    state: OutcomeState,
}

#[derive(Debug)]
enum OutcomeState {
    Ready(Option<Result<(), QueueError>>),
    Pending(oneshot::Receiver<Result<(), QueueError>>),
}

impl Outcome {
    /// An outcome that is already known, e.g. a fast-path rejection.
    pub fn ready(result: Result<(), QueueError>) -> Self {
        Self {
            state: OutcomeState::Ready(Some(result)),
        }
    }

    fn pending(rx: oneshot::Receiver<Result<(), QueueError>>) -> Self {
        Self {
            state: OutcomeState::Pending(rx),
        }
    }
}

impl Future for Outcome {
    type Output = Result<(), QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            OutcomeState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(QueueError::Abandoned)))
            }
            OutcomeState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(QueueError::Abandoned))),
        }
    }
}
