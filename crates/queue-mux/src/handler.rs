//! The queue handler: the transport-agnostic engine shared by producers,
//! consumers and backend adapters.
//!
//! A [`QueueHandler`] does not talk to any broker itself. Backends wrap it:
//! they drain its outgoing buffer ([`OutgoingMessages`]) to publish, and feed
//! messages they pull from the broker into [`QueueHandler::receive`], which
//! runs them through the registered handler chain once [`QueueHandler::start`]
//! has been called.
//!
//! # Lifecycle
//!
//! 1. A backend constructs the handler with [`QueueHandler::new`] and spawns
//!    its incoming/outgoing loops.
//! 2. The caller registers handlers with [`QueueHandler::add_handler`] and
//!    calls [`QueueHandler::start`]; this latches the ready signal that the
//!    backend's incoming loop waits on.
//! 3. [`QueueHandler::close`] latches the done signal; every loop observes it
//!    and exits.
//!
//! A handler used only for publishing never needs to be started.
//!
//! # Handler chain policy
//!
//! Every registered handler runs for every message, in registration order,
//! even after an earlier handler has failed. The first failure becomes the
//! message's outcome.

use crate::context::{MessageContext, PublishOptions};
use crate::error::{HandlerError, QueueError};
use crate::message::{Outcome, QueueMessage};
use crate::metrics::{NoOpQueueMetrics, QueueMetrics};
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
type HandlerFn = Arc<dyn Fn(MessageContext, Bytes) -> HandlerFuture + Send + Sync>;

// ============================================================================
// QueueHandler
// ============================================================================

/// Handle to a queue binding.
///
/// Cloning is cheap; all clones refer to the same buffers, handlers and
/// signals.
#[derive(Clone)]
pub struct QueueHandler {
    inner: Arc<Inner>,
}

struct Inner {
    uri: String,
    handlers: RwLock<Vec<HandlerFn>>,
    inbound_tx: mpsc::Sender<QueueMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<QueueMessage>>>,
    outbound_tx: mpsc::Sender<QueueMessage>,
    ready: watch::Sender<bool>,
    done: watch::Sender<bool>,
    visibility_ms: AtomicU64,
    metrics: Arc<dyn QueueMetrics>,
}

impl QueueHandler {
    /// Create a handler for `uri` whose in and out buffers hold `buffer_size`
    /// messages each.
    ///
    /// Returns the handler and the receiving end of its outgoing buffer, which
    /// the backend's outgoing loop drains.
    pub fn new(uri: impl Into<String>, buffer_size: usize) -> (Self, OutgoingMessages) {
        Self::with_metrics(uri, buffer_size, Arc::new(NoOpQueueMetrics))
    }

    /// Create a handler that reports to the given metrics collector.
    pub fn with_metrics(
        uri: impl Into<String>,
        buffer_size: usize,
        metrics: Arc<dyn QueueMetrics>,
    ) -> (Self, OutgoingMessages) {
        let capacity = buffer_size.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (ready, _) = watch::channel(false);
        let (done, _) = watch::channel(false);

        let handler = Self {
            inner: Arc::new(Inner {
                uri: uri.into(),
                handlers: RwLock::new(Vec::new()),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                outbound_tx,
                ready,
                done,
                visibility_ms: AtomicU64::new(0),
                metrics,
            }),
        };
        (handler, OutgoingMessages { rx: outbound_rx })
    }

    /// The URI this handler is bound to.
    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// Broker-advertised visibility timeout. Zero when unknown.
    pub fn visibility(&self) -> Duration {
        Duration::from_millis(self.inner.visibility_ms.load(Ordering::Relaxed))
    }

    /// Record the broker's visibility timeout. Called by backends.
    pub fn set_visibility(&self, visibility: Duration) {
        let millis = u64::try_from(visibility.as_millis()).unwrap_or(u64::MAX);
        self.inner.visibility_ms.store(millis, Ordering::Relaxed);
    }

    /// Append a message handler. Returns `self` for chaining.
    ///
    /// Handlers may be added after [`start`](Self::start); they apply from
    /// the next message on.
    pub fn add_handler<F, Fut>(&self, handler: F) -> &Self
    where
        F: Fn(MessageContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let boxed: HandlerFn = Arc::new(move |ctx, data| Box::pin(handler(ctx, data)));
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(boxed);
        self
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queue a message received from the broker for processing.
    ///
    /// Waits for space in the inbound buffer, then returns an [`Outcome`]
    /// that resolves once the handler chain has run. With no handlers
    /// registered the outcome is [`QueueError::NoHandlers`] and nothing is
    /// buffered.
    pub async fn receive(&self, context: MessageContext, data: Bytes) -> Outcome {
        if self.handler_count() == 0 {
            return Outcome::ready(Err(QueueError::NoHandlers));
        }

        let (message, outcome) = QueueMessage::new(data, context);
        if self.inner.inbound_tx.send(message).await.is_err() {
            return Outcome::ready(Err(self.closed_error()));
        }
        outcome
    }

    /// Publish a message through the backend.
    ///
    /// A fresh correlation ID is generated unless `options` supply one. The
    /// call returns once the backend has reported the send result.
    pub async fn publish(
        &self,
        data: impl Into<Bytes>,
        options: &[PublishOptions],
    ) -> Result<(), QueueError> {
        let context =
            MessageContext::new().with_options(PublishOptions::merge(options.iter().cloned()));
        let (message, outcome) = QueueMessage::new(data.into(), context);

        let result = match self.inner.outbound_tx.send(message).await {
            Ok(()) => outcome.await,
            Err(_) => Err(self.closed_error()),
        };

        self.inner.metrics.record_publish(self.uri(), result.is_ok());
        if let Err(err) = &result {
            debug!(uri = %self.uri(), error = %err, "publishing message failed");
        }
        result
    }

    /// Signal readiness and begin processing received messages.
    ///
    /// Must be called from within a tokio runtime. A second call fails with
    /// [`QueueError::AlreadyStarted`].
    pub fn start(&self) -> Result<(), QueueError> {
        let inbound = self
            .inner
            .inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| QueueError::AlreadyStarted {
                uri: self.uri().to_string(),
            })?;

        self.inner.ready.send_replace(true);
        tokio::spawn(self.clone().consume(inbound));
        Ok(())
    }

    /// Signal shutdown to the handler and every backend loop.
    pub fn close(&self) {
        let was_closed = self.inner.done.send_replace(true);
        if was_closed {
            error!(uri = %self.uri(), "queue handler closed more than once");
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Observer for the done signal.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.inner.done.subscribe())
    }

    /// Wait until [`start`](Self::start) has been called.
    ///
    /// Returns `false` if the handler is closed first.
    pub async fn wait_ready(&self) -> bool {
        let mut ready = self.inner.ready.subscribe();
        let mut shutdown = self.shutdown_signal();
        tokio::select! {
            biased;
            _ = shutdown.closed() => false,
            result = ready.wait_for(|ready| *ready) => result.is_ok(),
        }
    }

    fn handlers(&self) -> Vec<HandlerFn> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn closed_error(&self) -> QueueError {
        QueueError::Closed {
            uri: self.uri().to_string(),
        }
    }

    async fn consume(self, mut inbound: mpsc::Receiver<QueueMessage>) {
        let mut shutdown = self.shutdown_signal();
        info!(uri = %self.uri(), "queue handler starting");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.closed() => {
                    info!(uri = %self.uri(), "queue handler shutting down");
                    break;
                }
                message = inbound.recv() => match message {
                    Some(message) => self.process(message).await,
                    None => break,
                },
            }
        }
    }

    async fn process(&self, message: QueueMessage) {
        let (data, context, outcome) = message.into_parts();
        let metrics = &self.inner.metrics;
        let mut first_error: Option<HandlerError> = None;

        for (index, handler) in self.handlers().into_iter().enumerate() {
            let started = Instant::now();
            match handler(context.clone(), data.clone()).await {
                Ok(()) => metrics.record_processed(self.uri(), index, true),
                Err(err) => {
                    metrics.record_processed(self.uri(), index, false);
                    error!(
                        uri = %self.uri(),
                        handler_index = index,
                        correlation_id = %context.correlation_id(),
                        error = %err,
                        "handling message"
                    );
                    first_error.get_or_insert(err);
                }
            }
            metrics.record_processing_time(self.uri(), started.elapsed());
        }

        outcome.resolve(match first_error {
            Some(err) => Err(QueueError::Handler(err)),
            None => Ok(()),
        });
    }
}

impl fmt::Debug for QueueHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandler")
            .field("uri", &self.inner.uri)
            .field("handlers", &self.handler_count())
            .field("visibility", &self.visibility())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Backend-facing types
// ============================================================================

/// Receiving end of a handler's outgoing buffer.
#[derive(Debug)]
pub struct OutgoingMessages {
    rx: mpsc::Receiver<QueueMessage>,
}

impl OutgoingMessages {
    /// Wait for the next message to publish.
    pub async fn recv(&mut self) -> Option<QueueMessage> {
        self.rx.recv().await
    }
}

/// Observer for a handler's done signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Non-blocking check.
    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once the handler is closed.
    pub async fn closed(&mut self) {
        // An error means the handler itself is gone, which is shutdown too.
        let _ = self.0.wait_for(|closed| *closed).await;
    }
}
