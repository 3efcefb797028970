//! Topic/channel pub-sub backend for `nsqd://` and `nsqlookupd://` URIs.
//!
//! # URI convention
//!
//! `nsqd://host:port/<topic>/<channel>[#ephemeral]`
//!
//! The last path segment is the channel and everything before it the topic.
//! A URI with a single segment (`nsqd://host:port/<topic>`) has equal topic
//! and channel and runs in publish-only mode: no consumer is created. The
//! `#ephemeral` fragment appends `#ephemeral` to the channel name, asking the
//! broker for a non-durable subscription.
//!
//! The backend registered for `nsqd` connects straight to the daemon; the one
//! registered for `nsqlookupd` discovers daemons through the lookup service.
//! Publishing needs a daemon address, so publishing through an `nsqlookupd`
//! URI does nothing beyond logging a warning; the publish call still
//! succeeds.
//!
//! # Delivery
//!
//! Messages travel in a JSON envelope carrying the correlation ID next to the
//! payload (see [`Envelope`]). The handler chain's result is the broker
//! acknowledgement: success finishes the message, failure requeues it. There
//! is no local delete decision, so [`MessageContext::set_message_delete`] has
//! no effect here.

use super::nsq_client::NsqClient;
use crate::config::QueueMuxConfig;
use crate::context::{MessageContext, PublishOptions};
use crate::error::QueueError;
use crate::handler::{OutgoingMessages, QueueHandler};
use crate::metrics::{NoOpQueueMetrics, QueueMetrics};
use crate::registry::QueueBackend;
use crate::uri::QueueUri;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "nsq_tests.rs"]
mod tests;

/// Scheme for direct daemon connections.
pub const NSQD_SCHEME: &str = "nsqd";

/// Scheme for lookup-service discovery.
pub const NSQLOOKUPD_SCHEME: &str = "nsqlookupd";

const EPHEMERAL_FRAGMENT: &str = "ephemeral";

// ============================================================================
// Broker client traits
// ============================================================================

/// Where a consumer finds its daemons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NsqEndpoint {
    /// A single daemon, `host:port`
    Daemon(String),
    /// A lookup service, `host:port`
    Lookupd(String),
}

/// Receives messages on behalf of a consumer.
#[async_trait]
pub trait NsqMessageHandler: Send + Sync {
    /// Handle one message body. `Ok` finishes it, `Err` requeues it.
    async fn handle_message(&self, body: Bytes) -> Result<(), QueueError>;
}

/// A live subscription.
#[async_trait]
pub trait NsqConsumer: Send + Sync {
    /// Resolve once the consumer has stopped for good.
    async fn stopped(&self);

    /// Stop consuming and close connections.
    async fn stop(&self);
}

/// Publishes to a daemon.
#[async_trait]
pub trait NsqProducer: Send + Sync {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<(), QueueError>;
}

/// Factory for consumers and producers.
#[async_trait]
pub trait NsqConnector: Send + Sync {
    /// Subscribe `handler` to `topic`/`channel`.
    ///
    /// Fails when the first connection (or lookup) cannot be made; the caller
    /// retries after a backoff.
    async fn connect_consumer(
        &self,
        endpoint: &NsqEndpoint,
        topic: &str,
        channel: &str,
        handler: Arc<dyn NsqMessageHandler>,
    ) -> Result<Box<dyn NsqConsumer>, QueueError>;

    /// Create a producer for the daemon at `address`. Connects lazily.
    fn producer(&self, address: &str) -> Result<Box<dyn NsqProducer>, QueueError>;
}

// ============================================================================
// Envelope
// ============================================================================

/// Wire envelope: `{"CorrelationID": "...", "RawMessage": <payload JSON>}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<'a> {
    #[serde(rename = "CorrelationID", default)]
    pub correlation_id: String,

    #[serde(rename = "RawMessage", borrow)]
    pub raw_message: Option<&'a RawValue>,
}

impl<'a> Envelope<'a> {
    /// Wrap a JSON payload. An empty payload is sent as `null`.
    pub fn encode(correlation_id: &str, payload: &[u8]) -> Result<Bytes, QueueError> {
        let raw_message: Option<&RawValue> = if payload.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(payload)?)
        };
        let envelope = Envelope {
            correlation_id: correlation_id.to_string(),
            raw_message,
        };
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    /// Unwrap a message body.
    pub fn decode(body: &'a [u8]) -> Result<Self, QueueError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// The payload bytes; empty when the envelope carries none.
    pub fn payload(&self) -> Bytes {
        self.raw_message
            .map(|raw| Bytes::copy_from_slice(raw.get().as_bytes()))
            .unwrap_or_default()
    }
}

/// Feeds decoded envelopes into a queue handler.
struct EnvelopeHandler {
    handler: QueueHandler,
}

#[async_trait]
impl NsqMessageHandler for EnvelopeHandler {
    async fn handle_message(&self, body: Bytes) -> Result<(), QueueError> {
        let envelope = Envelope::decode(&body)?;
        let context = MessageContext::from_options(PublishOptions::with_correlation_id(
            envelope.correlation_id.clone(),
        ));
        self.handler.receive(context, envelope.payload()).await.await
    }
}

// ============================================================================
// URI parsing
// ============================================================================

/// Topic and channel addressed by a URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub channel: String,
}

impl Subscription {
    /// Split the URI path into topic and channel.
    pub fn from_uri(uri: &QueueUri) -> Result<Self, QueueError> {
        let path = uri.path().trim_end_matches('/');
        let (dir, base) = match path.rfind('/') {
            Some(index) => (&path[..index], &path[index + 1..]),
            None => ("", path),
        };
        if base.is_empty() {
            return Err(QueueError::invalid_uri(uri.as_str(), "missing topic"));
        }

        let mut channel = base.to_string();
        if uri.fragment() == Some(EPHEMERAL_FRAGMENT) {
            channel.push_str("#ephemeral");
        }
        let mut topic = dir.trim_start_matches('/').to_string();
        if topic.is_empty() {
            topic = channel.clone();
        }

        Ok(Self { topic, channel })
    }

    /// Publish-only URIs name a topic but no channel.
    pub fn is_publish_only(&self) -> bool {
        self.topic == self.channel
    }
}

// ============================================================================
// NsqBackend
// ============================================================================

/// Queue backend for `nsqd://` or `nsqlookupd://` URIs.
pub struct NsqBackend {
    connector: Arc<dyn NsqConnector>,
    use_lookupd: bool,
    buffer_size: usize,
    reconnect_backoff: Duration,
    metrics: Arc<dyn QueueMetrics>,
}

impl NsqBackend {
    /// Backend using the wire client. `use_lookupd` selects discovery.
    pub fn from_config(config: &QueueMuxConfig, use_lookupd: bool) -> Result<Self, QueueError> {
        let client = NsqClient::new(&config.nsq)?;
        Ok(Self::with_connector(Arc::new(client), config, use_lookupd))
    }

    /// Backend on top of an arbitrary [`NsqConnector`].
    pub fn with_connector(
        connector: Arc<dyn NsqConnector>,
        config: &QueueMuxConfig,
        use_lookupd: bool,
    ) -> Self {
        Self {
            connector,
            use_lookupd,
            buffer_size: config.buffer_size,
            reconnect_backoff: config.nsq.reconnect_backoff(),
            metrics: Arc::new(NoOpQueueMetrics),
        }
    }

    /// Report handler metrics to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn QueueMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

impl std::fmt::Debug for NsqBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NsqBackend")
            .field("use_lookupd", &self.use_lookupd)
            .field("buffer_size", &self.buffer_size)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .finish()
    }
}

#[async_trait]
impl QueueBackend for NsqBackend {
    async fn queue(&self, uri: &QueueUri) -> Result<QueueHandler, QueueError> {
        uri.require_scheme(&[NSQD_SCHEME, NSQLOOKUPD_SCHEME])?;
        let address = uri.authority();
        if address.is_empty() {
            return Err(QueueError::invalid_uri(uri.as_str(), "missing broker address"));
        }
        let subscription = Subscription::from_uri(uri)?;

        // Create the producer before anything is spawned so a failure leaves
        // nothing running.
        let producer = if uri.scheme() == NSQD_SCHEME {
            Some(self.connector.producer(&address)?)
        } else {
            None
        };

        let (handler, outgoing) =
            QueueHandler::with_metrics(uri.as_str(), self.buffer_size, Arc::clone(&self.metrics));

        if subscription.is_publish_only() {
            info!(topic = %subscription.topic, "queue started in publish only mode");
        } else {
            let endpoint = if self.use_lookupd {
                NsqEndpoint::Lookupd(address)
            } else {
                NsqEndpoint::Daemon(address)
            };
            tokio::spawn(consume(
                handler.clone(),
                Arc::clone(&self.connector),
                endpoint,
                subscription.clone(),
                self.reconnect_backoff,
            ));
        }

        match producer {
            Some(producer) => {
                tokio::spawn(publish(handler.clone(), outgoing, producer, subscription.topic));
            }
            None => {
                warn!(uri = %uri, "queue is in non publishing mode");
                tokio::spawn(discard_publishes(handler.clone(), outgoing));
            }
        }

        Ok(handler)
    }
}

/// Incoming loop: keep a consumer connected until either side stops.
async fn consume(
    handler: QueueHandler,
    connector: Arc<dyn NsqConnector>,
    endpoint: NsqEndpoint,
    subscription: Subscription,
    reconnect_backoff: Duration,
) {
    if !handler.wait_ready().await {
        return;
    }

    let Subscription { topic, channel } = subscription;
    let message_handler: Arc<dyn NsqMessageHandler> = Arc::new(EnvelopeHandler {
        handler: handler.clone(),
    });
    let mut shutdown = handler.shutdown_signal();

    loop {
        info!(topic = %topic, channel = %channel, "nsq queue consumer starting");

        let connected = tokio::select! {
            biased;
            _ = shutdown.closed() => break,
            connected = connector.connect_consumer(
                &endpoint,
                &topic,
                &channel,
                Arc::clone(&message_handler),
            ) => connected,
        };

        let consumer = match connected {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(
                    topic = %topic,
                    channel = %channel,
                    endpoint = ?endpoint,
                    error = %err,
                    "connecting to nsq"
                );
                tokio::select! {
                    biased;
                    _ = shutdown.closed() => break,
                    _ = tokio::time::sleep(reconnect_backoff) => continue,
                }
            }
        };

        tokio::select! {
            _ = consumer.stopped() => {
                warn!(topic = %topic, channel = %channel, "nsq consumer stopping");
            }
            _ = shutdown.closed() => {
                warn!(topic = %topic, channel = %channel, "nsq handler stopping");
                consumer.stop().await;
            }
        }
        break;
    }
}

/// Outgoing loop for daemon URIs.
async fn publish(
    handler: QueueHandler,
    mut outgoing: OutgoingMessages,
    producer: Box<dyn NsqProducer>,
    topic: String,
) {
    let mut shutdown = handler.shutdown_signal();
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.closed() => {
                info!(topic = %topic, "nsq queue publisher shutting down");
                break;
            }
            message = outgoing.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        let (data, context, outcome) = message.into_parts();
        let body = match Envelope::encode(context.correlation_id(), &data) {
            Ok(body) => body,
            Err(err) => {
                error!(topic = %topic, error = %err, "error marshaling json (nsq)");
                outcome.fail(err);
                continue;
            }
        };

        let result = producer.publish(&topic, body).await;
        match &result {
            Ok(()) => debug!(topic = %topic, "message published"),
            Err(err) => error!(topic = %topic, error = %err, "error publishing to nsq"),
        }
        outcome.resolve(result);
    }
}

/// Outgoing loop for lookup URIs: every publish is dropped.
async fn discard_publishes(handler: QueueHandler, mut outgoing: OutgoingMessages) {
    let mut shutdown = handler.shutdown_signal();
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.closed() => break,
            message = outgoing.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        warn!(uri = %handler.uri(), "publishing requires an nsqd uri, message dropped");
        message.complete();
    }
}
