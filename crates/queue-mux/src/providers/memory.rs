//! In-process queue backend for testing and development.
//!
//! A [`MemoryBroker`] simulates a broker with one bounded channel per URI host
//! (`mem://<host>/...`). Every handler bound to the same host on the same
//! broker shares that channel, so a publisher and a consumer in the same
//! process talk to each other exactly as they would through a real queue.
//!
//! Delivery follows the same acknowledgement policy as the SQS backend:
//! a message is dropped once its handler chain succeeds, unless a handler
//! overrides the decision through
//! [`MessageContext::set_message_delete`]. Messages that are kept are put back
//! on the channel after a delay.
//!
//! Publishing is fire-and-forget: `publish` succeeds as soon as the message is
//! on the channel, whether or not anything ever consumes it. Nothing is
//! persisted, so this backend is not suitable beyond tests and local runs.

use crate::config::QueueMuxConfig;
use crate::context::MessageContext;
use crate::error::QueueError;
use crate::handler::{OutgoingMessages, QueueHandler};
use crate::metrics::{NoOpQueueMetrics, QueueMetrics};
use crate::registry::QueueBackend;
use crate::uri::QueueUri;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// URI scheme served by [`MemoryBackend`].
pub const MEMORY_SCHEME: &str = "mem";

const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

// ============================================================================
// MemoryBroker
// ============================================================================

/// A message parked on a simulated broker channel.
#[derive(Debug)]
struct StoredMessage {
    data: Bytes,
    context: MessageContext,
}

impl StoredMessage {
    /// Copy for another delivery attempt, with a fresh acknowledgement override.
    fn redelivery(self) -> Self {
        Self {
            data: self.data,
            context: MessageContext::from_options(self.context.options().clone()),
        }
    }
}

/// One simulated broker channel. Any number of consumers may share it.
#[derive(Clone)]
struct Pipe {
    tx: mpsc::Sender<StoredMessage>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<StoredMessage>>>,
}

impl Pipe {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    async fn recv(&self) -> Option<StoredMessage> {
        self.rx.lock().await.recv().await
    }
}

/// Simulated broker holding named channels.
pub struct MemoryBroker {
    pipes: Mutex<HashMap<String, Pipe>>,
    capacity: usize,
}

impl MemoryBroker {
    /// Create an empty broker with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create an empty broker whose channels hold `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pipes: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// The process-wide broker used by [`default_registry`](crate::default_registry).
    pub fn global() -> Arc<MemoryBroker> {
        static GLOBAL: OnceLock<Arc<MemoryBroker>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MemoryBroker::new())))
    }

    /// Number of channels created so far.
    pub fn channel_count(&self) -> usize {
        self.pipes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Get the channel for `key`, creating it on first use.
    fn pipe(&self, key: &str) -> Pipe {
        let mut pipes = self.pipes.lock().unwrap_or_else(PoisonError::into_inner);
        pipes
            .entry(key.to_string())
            .or_insert_with(|| Pipe::new(self.capacity))
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("channels", &self.channel_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// ============================================================================
// MemoryBackend
// ============================================================================

/// Queue backend for `mem://` URIs.
pub struct MemoryBackend {
    broker: Arc<MemoryBroker>,
    buffer_size: usize,
    requeue_delay: Duration,
    metrics: Arc<dyn QueueMetrics>,
}

impl MemoryBackend {
    /// Create a backend on `broker` with default settings.
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self::from_config(broker, &QueueMuxConfig::default())
    }

    /// Create a backend on `broker` using `config`.
    pub fn from_config(broker: Arc<MemoryBroker>, config: &QueueMuxConfig) -> Self {
        Self {
            broker,
            buffer_size: config.buffer_size,
            requeue_delay: config.memory.requeue_delay(),
            metrics: Arc::new(NoOpQueueMetrics),
        }
    }

    /// Report handler metrics to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn QueueMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Override the delay before a kept message is redelivered.
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("broker", &self.broker)
            .field("buffer_size", &self.buffer_size)
            .field("requeue_delay", &self.requeue_delay)
            .finish()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn queue(&self, uri: &QueueUri) -> Result<QueueHandler, QueueError> {
        uri.require_scheme(&[MEMORY_SCHEME])?;

        let (handler, outgoing) =
            QueueHandler::with_metrics(uri.as_str(), self.buffer_size, Arc::clone(&self.metrics));
        let key = uri.authority();

        let pipe = self.broker.pipe(&key);
        tokio::spawn(consume(handler.clone(), pipe, self.requeue_delay));
        tokio::spawn(publish(
            handler.clone(),
            outgoing,
            Arc::clone(&self.broker),
            key,
        ));

        Ok(handler)
    }
}

/// Incoming loop: feed channel messages to the handler, requeueing kept ones.
async fn consume(handler: QueueHandler, pipe: Pipe, requeue_delay: Duration) {
    if !handler.wait_ready().await {
        return;
    }
    info!(uri = %handler.uri(), "queue consumer starting");

    let mut shutdown = handler.shutdown_signal();
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.closed() => {
                info!(uri = %handler.uri(), "queue consumer shutting down");
                break;
            }
            message = pipe.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        let result = handler
            .receive(message.context.clone(), message.data.clone())
            .await
            .await;

        if message.context.disposition().should_delete(result.is_ok()) {
            debug!(uri = %handler.uri(), "message processed");
            continue;
        }

        warn!(
            uri = %handler.uri(),
            delay_ms = requeue_delay.as_millis() as u64,
            "requeueing failed message"
        );
        let tx = pipe.tx.clone();
        let redelivery = message.redelivery();
        tokio::spawn(async move {
            tokio::time::sleep(requeue_delay).await;
            // The broker owns both channel ends, so sending cannot fail.
            let _ = tx.send(redelivery).await;
        });
    }
}

/// Outgoing loop: push published messages onto the host's channel.
async fn publish(
    handler: QueueHandler,
    mut outgoing: OutgoingMessages,
    broker: Arc<MemoryBroker>,
    key: String,
) {
    info!(uri = %handler.uri(), "queue publisher starting");

    let mut shutdown = handler.shutdown_signal();
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.closed() => {
                info!(uri = %handler.uri(), "queue publisher shutting down");
                break;
            }
            message = outgoing.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        let (data, _context, outcome) = message.into_parts();
        let stored = StoredMessage {
            data,
            context: MessageContext::new(),
        };
        match broker.pipe(&key).tx.send(stored).await {
            Ok(()) => outcome.complete(),
            Err(_) => outcome.fail(QueueError::Closed {
                uri: handler.uri().to_string(),
            }),
        }
    }
}
