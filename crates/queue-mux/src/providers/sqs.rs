//! Cloud queue backend for `sqs://<queue-name>` URIs.
//!
//! The backend resolves the queue URL once per handler, then runs two loops:
//!
//! - **Incoming**: after [`QueueHandler::start`], long-polls the queue and
//!   feeds each message through the handler chain. A processed message is
//!   deleted when the chain succeeds, unless a handler overrode the decision
//!   with [`MessageContext::set_message_delete`]. Messages that are not
//!   deleted become visible again once the queue's visibility timeout lapses.
//! - **Outgoing**: sends published messages with their correlation ID in the
//!   `correlation_id` message attribute.
//!
//! Broker access goes through the [`SqsApi`] trait so the loops can be tested
//! without a network. [`SqsHttpClient`](super::SqsHttpClient) is the
//! production implementation.

use super::sqs_http::SqsHttpClient;
use crate::config::QueueMuxConfig;
use crate::context::{MessageContext, PublishOptions};
use crate::error::QueueError;
use crate::handler::{OutgoingMessages, QueueHandler};
use crate::metrics::{NoOpQueueMetrics, QueueMetrics};
use crate::registry::QueueBackend;
use crate::uri::QueueUri;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

/// URI scheme served by [`SqsBackend`].
pub const SQS_SCHEME: &str = "sqs";

/// Message attribute carrying the correlation ID.
pub const CORRELATION_ID_ATTRIBUTE: &str = "correlation_id";

// ============================================================================
// SqsApi
// ============================================================================

/// A message pulled from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqsMessage {
    pub body: Bytes,
    pub receipt_handle: String,
    /// Value of the `correlation_id` attribute, if the sender set one
    pub correlation_id: Option<String>,
}

/// The subset of the queue service used by [`SqsBackend`].
#[async_trait]
pub trait SqsApi: Send + Sync {
    /// Resolve a queue name to its URL.
    async fn get_queue_url(&self, queue_name: &str) -> Result<String, QueueError>;

    /// The queue's configured visibility timeout.
    async fn get_visibility_timeout(&self, queue_url: &str) -> Result<Duration, QueueError>;

    /// Long-poll for up to `max_messages` messages, waiting at most `wait`.
    ///
    /// Implementations must request the `correlation_id` message attribute.
    async fn receive_messages(
        &self,
        queue_url: &str,
        wait: Duration,
        max_messages: u32,
    ) -> Result<Vec<SqsMessage>, QueueError>;

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str)
        -> Result<(), QueueError>;

    /// Send one message tagged with `correlation_id`. Returns the message ID.
    async fn send_message(
        &self,
        queue_url: &str,
        body: &Bytes,
        correlation_id: &str,
    ) -> Result<String, QueueError>;
}

// ============================================================================
// SqsBackend
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct PollSettings {
    wait: Duration,
    max_messages: u32,
    backoff: Duration,
}

/// Queue backend for `sqs://` URIs.
pub struct SqsBackend {
    api: Arc<dyn SqsApi>,
    buffer_size: usize,
    poll: PollSettings,
    metrics: Arc<dyn QueueMetrics>,
}

impl SqsBackend {
    /// Create a backend talking to the service over HTTP.
    pub fn from_config(config: &QueueMuxConfig) -> Result<Self, QueueError> {
        let client = SqsHttpClient::new(&config.sqs)?;
        Ok(Self::with_api(Arc::new(client), config))
    }

    /// Create a backend on top of an arbitrary [`SqsApi`].
    pub fn with_api(api: Arc<dyn SqsApi>, config: &QueueMuxConfig) -> Self {
        Self {
            api,
            buffer_size: config.buffer_size,
            poll: PollSettings {
                wait: Duration::from_secs(config.sqs.wait_time_seconds),
                max_messages: config.sqs.max_messages,
                backoff: config.sqs.poll_backoff(),
            },
            metrics: Arc::new(NoOpQueueMetrics),
        }
    }

    /// Report handler metrics to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn QueueMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

impl std::fmt::Debug for SqsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqsBackend")
            .field("buffer_size", &self.buffer_size)
            .field("poll", &self.poll)
            .finish()
    }
}

#[async_trait]
impl QueueBackend for SqsBackend {
    async fn queue(&self, uri: &QueueUri) -> Result<QueueHandler, QueueError> {
        uri.require_scheme(&[SQS_SCHEME])?;
        let queue_name = uri.host();
        if queue_name.is_empty() {
            return Err(QueueError::invalid_uri(uri.as_str(), "missing queue name"));
        }

        let queue_url = self.api.get_queue_url(queue_name).await?;

        let (handler, outgoing) =
            QueueHandler::with_metrics(uri.as_str(), self.buffer_size, Arc::clone(&self.metrics));

        match self.api.get_visibility_timeout(&queue_url).await {
            Ok(visibility) => handler.set_visibility(visibility),
            Err(err) => {
                warn!(uri = %uri, error = %err, "reading queue visibility timeout");
            }
        }

        tokio::spawn(poll(
            handler.clone(),
            Arc::clone(&self.api),
            queue_url.clone(),
            self.poll,
        ));
        tokio::spawn(send(handler.clone(), outgoing, Arc::clone(&self.api), queue_url));

        Ok(handler)
    }
}

/// Incoming loop.
async fn poll(handler: QueueHandler, api: Arc<dyn SqsApi>, queue_url: String, settings: PollSettings) {
    if !handler.wait_ready().await {
        return;
    }
    info!(uri = %handler.uri(), "queue consumer starting");

    let mut shutdown = handler.shutdown_signal();
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.closed() => break,
            received = api.receive_messages(&queue_url, settings.wait, settings.max_messages) => received,
        };

        let messages = match received {
            Ok(messages) => messages,
            Err(err) => {
                warn!(uri = %handler.uri(), error = %err, "error receiving message from queue");
                tokio::select! {
                    biased;
                    _ = shutdown.closed() => break,
                    _ = tokio::time::sleep(settings.backoff) => continue,
                }
            }
        };

        for message in messages {
            process(&handler, api.as_ref(), &queue_url, message).await;
        }
    }

    info!(uri = %handler.uri(), "queue consumer shutting down");
}

async fn process(handler: &QueueHandler, api: &dyn SqsApi, queue_url: &str, message: SqsMessage) {
    let context = MessageContext::from_options(PublishOptions {
        correlation_id: message.correlation_id,
    });

    let result = handler.receive(context.clone(), message.body).await.await;
    if !context.disposition().should_delete(result.is_ok()) {
        debug!(
            uri = %handler.uri(),
            correlation_id = %context.correlation_id(),
            "leaving message on queue"
        );
        return;
    }

    if let Err(err) = api.delete_message(queue_url, &message.receipt_handle).await {
        error!(uri = %handler.uri(), error = %err, "deleting processed message");
    }
}

/// Outgoing loop.
async fn send(
    handler: QueueHandler,
    mut outgoing: OutgoingMessages,
    api: Arc<dyn SqsApi>,
    queue_url: String,
) {
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

        let (data, context, outcome) = message.into_parts();
        let result = api
            .send_message(&queue_url, &data, context.correlation_id())
            .await
            .map(|message_id| {
                debug!(uri = %handler.uri(), message_id = %message_id, "message sent");
            });
        outcome.resolve(result);
    }
}
