//! Wire client for nsqd (TCP protocol `V2`) and nsqlookupd (HTTP).
//!
//! Consumers hold one connection per daemon. A reader task answers
//! heartbeats and forwards messages to a worker that runs the handler and
//! writes `FIN` or `REQ` back. A dropped daemon connection is re-established
//! after the reconnect backoff; an error frame from the broker stops the
//! consumer. Lookup consumers poll nsqlookupd and connect to every producer
//! it reports for the topic.

use super::nsq::{NsqConnector, NsqConsumer, NsqEndpoint, NsqMessageHandler, NsqProducer};
use crate::config::NsqConfig;
use crate::error::QueueError;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "nsq_client_tests.rs"]
mod tests;

const MAGIC_V2: &[u8] = b"  V2";

const FRAME_TYPE_RESPONSE: u32 = 0;
const FRAME_TYPE_ERROR: u32 = 1;
const FRAME_TYPE_MESSAGE: u32 = 2;

const HEARTBEAT: &[u8] = b"_heartbeat_";
const OK_RESPONSE: &[u8] = b"OK";

/// Timestamp (8) + attempts (2) + id (16)
const MESSAGE_HEADER_SIZE: usize = 26;
const MESSAGE_ID_SIZE: usize = 16;

const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const MAX_REQUEUE_DELAY: Duration = Duration::from_secs(15 * 60);

/// Broker errors that leave the connection usable.
const NON_FATAL_ERRORS: &[&str] = &["E_FIN_FAILED", "E_REQ_FAILED", "E_TOUCH_FAILED"];

// ============================================================================
// Frames and commands
// ============================================================================

/// A message pushed by nsqd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WireMessage {
    pub id: Bytes,
    pub timestamp: i64,
    pub attempts: u16,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(WireMessage),
}

impl Frame {
    fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(data) if data.as_ref() == HEARTBEAT)
    }
}

pub(crate) fn decode_frame(frame_type: u32, mut data: Bytes) -> Result<Frame, QueueError> {
    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Frame::Response(data)),
        FRAME_TYPE_ERROR => Ok(Frame::Error(data)),
        FRAME_TYPE_MESSAGE => {
            if data.len() < MESSAGE_HEADER_SIZE {
                return Err(protocol_error(format!(
                    "message frame of {} bytes is truncated",
                    data.len()
                )));
            }
            let timestamp = data.get_i64();
            let attempts = data.get_u16();
            let id = data.split_to(MESSAGE_ID_SIZE);
            Ok(Frame::Message(WireMessage {
                id,
                timestamp,
                attempts,
                body: data,
            }))
        }
        other => Err(protocol_error(format!("unknown frame type {}", other))),
    }
}

/// Read one `size | type | data` frame.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Frame, QueueError>
where
    R: AsyncRead + Unpin,
{
    let size = reader.read_u32().await.map_err(connection_error)? as usize;
    if !(4..=MAX_FRAME_SIZE).contains(&size) {
        return Err(protocol_error(format!("invalid frame size {}", size)));
    }
    let frame_type = reader.read_u32().await.map_err(connection_error)?;
    let mut data = vec![0u8; size - 4];
    reader
        .read_exact(&mut data)
        .await
        .map_err(connection_error)?;
    decode_frame(frame_type, Bytes::from(data))
}

/// `NAME arg1 arg2\n`
pub(crate) fn command(name: &str, args: &[&str]) -> Vec<u8> {
    let mut line = name.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line.push('\n');
    line.into_bytes()
}

/// `PUB topic\n` followed by the size-prefixed body.
pub(crate) fn publish_command(topic: &str, body: &[u8]) -> Result<Vec<u8>, QueueError> {
    let size = body_size(body.len())?;
    let mut buf = command("PUB", &[topic]);
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Length prefix for a message body; the wire format carries a u32.
fn body_size(len: usize) -> Result<u32, QueueError> {
    u32::try_from(len).map_err(|_| QueueError::ProviderError {
        provider: "nsq".to_string(),
        code: "E_BAD_MESSAGE".to_string(),
        message: format!("message body of {} bytes exceeds the protocol limit", len),
    })
}

fn finish_command(id: &[u8]) -> Vec<u8> {
    let id = String::from_utf8_lossy(id);
    command("FIN", &[id.as_ref()])
}

fn requeue_command(id: &[u8], delay: Duration) -> Vec<u8> {
    let id = String::from_utf8_lossy(id);
    let delay_ms = delay.as_millis().to_string();
    command("REQ", &[id.as_ref(), delay_ms.as_str()])
}

/// Requeue delay grows with the delivery attempt, up to 15 minutes.
pub(crate) fn requeue_delay(base: Duration, attempts: u16) -> Duration {
    base.saturating_mul(u32::from(attempts.max(1)))
        .min(MAX_REQUEUE_DELAY)
}

fn broker_error(data: &[u8]) -> QueueError {
    let message = String::from_utf8_lossy(data).trim().to_string();
    let code = message
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    QueueError::ProviderError {
        provider: "nsq".to_string(),
        code,
        message,
    }
}

fn is_fatal(err: &QueueError) -> bool {
    match err {
        QueueError::ProviderError { code, .. } => !NON_FATAL_ERRORS.contains(&code.as_str()),
        _ => true,
    }
}

fn connection_error(err: std::io::Error) -> QueueError {
    QueueError::ConnectionFailed {
        message: err.to_string(),
    }
}

fn protocol_error(message: String) -> QueueError {
    QueueError::ConnectionFailed { message }
}

// ============================================================================
// Connection
// ============================================================================

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(address: &str, dial_timeout: Duration) -> Result<Self, QueueError> {
        let stream = match tokio::time::timeout(dial_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(QueueError::ConnectionFailed {
                    message: format!("connecting to {}: {}", address, err),
                })
            }
            Err(_) => {
                return Err(QueueError::ConnectionFailed {
                    message: format!("connecting to {}: timed out", address),
                })
            }
        };
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let mut connection = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };
        connection.send(MAGIC_V2).await?;
        debug!(address = %address, "nsqd connection established");
        Ok(connection)
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), QueueError> {
        self.writer.write_all(data).await.map_err(connection_error)?;
        self.writer.flush().await.map_err(connection_error)
    }

    /// Wait for the response to the last command, answering heartbeats.
    async fn read_response(&mut self) -> Result<Bytes, QueueError> {
        loop {
            match read_frame(&mut self.reader).await? {
                frame if frame.is_heartbeat() => self.send(b"NOP\n").await?,
                Frame::Response(data) => return Ok(data),
                Frame::Error(data) => return Err(broker_error(&data)),
                Frame::Message(_) => {
                    return Err(protocol_error(
                        "unexpected message while waiting for a response".to_string(),
                    ))
                }
            }
        }
    }

    async fn publish(&mut self, topic: &str, body: &[u8]) -> Result<(), QueueError> {
        self.send(&publish_command(topic, body)?).await?;
        let response = self.read_response().await?;
        if response.as_ref() != OK_RESPONSE {
            warn!(
                topic = %topic,
                response = %String::from_utf8_lossy(&response),
                "unexpected publish response"
            );
        }
        Ok(())
    }
}

async fn write_shared(writer: &Mutex<OwnedWriteHalf>, data: &[u8]) -> Result<(), QueueError> {
    let mut writer = writer.lock().await;
    writer.write_all(data).await.map_err(connection_error)?;
    writer.flush().await.map_err(connection_error)
}

// ============================================================================
// NsqClient
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupResponse {
    Wrapped { data: LookupData },
    Plain(LookupData),
}

#[derive(Debug, Deserialize)]
struct LookupData {
    #[serde(default)]
    producers: Vec<LookupProducer>,
}

#[derive(Debug, Deserialize)]
struct LookupProducer {
    broadcast_address: String,
    tcp_port: u16,
}

/// Connects consumers and producers to NSQ.
#[derive(Debug, Clone)]
pub struct NsqClient {
    config: NsqConfig,
    http_client: reqwest::Client,
}

impl NsqClient {
    pub fn new(config: &NsqConfig) -> Result<Self, QueueError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.dial_timeout())
            .timeout(config.dial_timeout() * 2)
            .build()
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            config: config.clone(),
            http_client,
        })
    }

    /// Daemon addresses (`host:port`) producing `topic`, per nsqlookupd.
    ///
    /// An unknown topic yields an empty list.
    pub async fn lookup(&self, lookupd: &str, topic: &str) -> Result<Vec<String>, QueueError> {
        let base = if lookupd.starts_with("http://") || lookupd.starts_with("https://") {
            lookupd.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", lookupd)
        };

        let response = self
            .http_client
            .get(format!("{}/lookup", base))
            .query(&[("topic", topic)])
            .send()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("querying nsqlookupd {}: {}", lookupd, e),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueueError::ProviderError {
                provider: "nsqlookupd".to_string(),
                code: status.as_u16().to_string(),
                message: body,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("reading nsqlookupd response: {}", e),
            })?;
        let data = match serde_json::from_slice::<LookupResponse>(&body)? {
            LookupResponse::Wrapped { data } => data,
            LookupResponse::Plain(data) => data,
        };

        Ok(data
            .producers
            .into_iter()
            .map(|p| format!("{}:{}", p.broadcast_address, p.tcp_port))
            .collect())
    }

    /// Open a connection subscribed to `topic`/`channel` and ready for messages.
    async fn subscribe(
        &self,
        address: &str,
        topic: &str,
        channel: &str,
    ) -> Result<Connection, QueueError> {
        let mut connection = Connection::open(address, self.config.dial_timeout()).await?;
        connection.send(&command("SUB", &[topic, channel])).await?;
        connection.read_response().await?;
        let ready = self.config.max_in_flight.max(1).to_string();
        connection.send(&command("RDY", &[ready.as_str()])).await?;
        info!(address = %address, topic = %topic, channel = %channel, "subscribed to nsqd");
        Ok(connection)
    }
}

#[async_trait]
impl NsqConnector for NsqClient {
    async fn connect_consumer(
        &self,
        endpoint: &NsqEndpoint,
        topic: &str,
        channel: &str,
        handler: Arc<dyn NsqMessageHandler>,
    ) -> Result<Box<dyn NsqConsumer>, QueueError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let subscription = SubscriptionTask {
            client: self.clone(),
            topic: topic.to_string(),
            channel: channel.to_string(),
            handler,
        };

        match endpoint {
            NsqEndpoint::Daemon(address) => {
                let connection = self.subscribe(address, topic, channel).await?;
                let address = address.clone();
                tokio::spawn(async move {
                    subscription
                        .supervise_daemon(address, connection, stop_rx)
                        .await;
                    stopped_tx.send_replace(true);
                });
            }
            NsqEndpoint::Lookupd(lookupd) => {
                let addresses = self.lookup(lookupd, topic).await?;
                if addresses.is_empty() {
                    info!(lookupd = %lookupd, topic = %topic, "no nsqd producers yet");
                }
                let lookupd = lookupd.clone();
                tokio::spawn(async move {
                    subscription
                        .supervise_lookupd(lookupd, addresses, stop_rx)
                        .await;
                    stopped_tx.send_replace(true);
                });
            }
        }

        Ok(Box::new(ClientConsumer {
            stop: stop_tx,
            stopped: stopped_rx,
        }))
    }

    fn producer(&self, address: &str) -> Result<Box<dyn NsqProducer>, QueueError> {
        Ok(Box::new(ClientProducer {
            address: address.to_string(),
            dial_timeout: self.config.dial_timeout(),
            connection: Mutex::new(None),
        }))
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct ClientConsumer {
    stop: watch::Sender<bool>,
    stopped: watch::Receiver<bool>,
}

#[async_trait]
impl NsqConsumer for ClientConsumer {
    async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    async fn stop(&self) {
        self.stop.send_replace(true);
        self.stopped().await;
    }
}

async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Sleep for `delay`; returns true if a stop was requested first.
async fn sleep_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = wait_stopped(stop) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

enum SessionEnd {
    Stopped,
    Disconnected(QueueError),
    Rejected(QueueError),
}

#[derive(Clone)]
struct SubscriptionTask {
    client: NsqClient,
    topic: String,
    channel: String,
    handler: Arc<dyn NsqMessageHandler>,
}

impl SubscriptionTask {
    /// Keep one daemon subscribed, reconnecting after dropped connections.
    async fn supervise_daemon(
        &self,
        address: String,
        connection: Connection,
        mut stop: watch::Receiver<bool>,
    ) {
        let backoff = self.client.config.reconnect_backoff();
        let mut pending = Some(connection);
        loop {
            let connection = match pending.take() {
                Some(connection) => connection,
                None => match self
                    .client
                    .subscribe(&address, &self.topic, &self.channel)
                    .await
                {
                    Ok(connection) => connection,
                    Err(err) => {
                        warn!(address = %address, error = %err, "reconnecting to nsqd");
                        if sleep_or_stop(&mut stop, backoff).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            match self.run_session(connection, stop.clone()).await {
                SessionEnd::Stopped => break,
                SessionEnd::Rejected(err) => {
                    error!(address = %address, error = %err, "nsqd rejected the consumer");
                    break;
                }
                SessionEnd::Disconnected(err) => {
                    warn!(address = %address, error = %err, "nsqd connection lost");
                    if sleep_or_stop(&mut stop, backoff).await {
                        break;
                    }
                }
            }
        }
    }

    /// Follow the producers nsqlookupd reports for the topic.
    async fn supervise_lookupd(
        &self,
        lookupd: String,
        mut addresses: Vec<String>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut sessions: HashMap<String, JoinHandle<()>> = HashMap::new();
        loop {
            sessions.retain(|_, task| !task.is_finished());
            for address in addresses {
                if sessions.contains_key(&address) {
                    continue;
                }
                info!(address = %address, topic = %self.topic, "connecting to discovered nsqd");
                let task = tokio::spawn(self.clone().daemon_session(address.clone(), stop.clone()));
                sessions.insert(address, task);
            }

            if sleep_or_stop(&mut stop, self.client.config.lookupd_poll_interval()).await {
                break;
            }
            addresses = match self.client.lookup(&lookupd, &self.topic).await {
                Ok(addresses) => addresses,
                Err(err) => {
                    warn!(lookupd = %lookupd, error = %err, "querying nsqlookupd");
                    Vec::new()
                }
            };
        }

        for (_, task) in sessions {
            let _ = task.await;
        }
    }

    /// One connection to a discovered daemon; the next poll reconnects it.
    async fn daemon_session(self, address: String, stop: watch::Receiver<bool>) {
        let connection = match self
            .client
            .subscribe(&address, &self.topic, &self.channel)
            .await
        {
            Ok(connection) => connection,
            Err(err) => {
                warn!(address = %address, error = %err, "connecting to nsqd");
                return;
            }
        };
        match self.run_session(connection, stop).await {
            SessionEnd::Stopped => {}
            SessionEnd::Disconnected(err) => {
                warn!(address = %address, error = %err, "nsqd connection lost")
            }
            SessionEnd::Rejected(err) => {
                error!(address = %address, error = %err, "nsqd rejected the consumer")
            }
        }
    }

    /// Pump frames until the connection drops or a stop is requested.
    async fn run_session(
        &self,
        connection: Connection,
        mut stop: watch::Receiver<bool>,
    ) -> SessionEnd {
        let Connection { mut reader, writer } = connection;
        let writer = Arc::new(Mutex::new(writer));
        let capacity = self.client.config.max_in_flight.max(1) as usize;
        let (tx, rx) = mpsc::channel(capacity);
        let worker = tokio::spawn(process_messages(
            rx,
            Arc::clone(&self.handler),
            Arc::clone(&writer),
            self.client.config.requeue_delay(),
        ));

        let end = loop {
            let frame = tokio::select! {
                biased;
                _ = wait_stopped(&mut stop) => {
                    let _ = write_shared(&writer, b"CLS\n").await;
                    break SessionEnd::Stopped;
                }
                frame = read_frame(&mut reader) => frame,
            };

            match frame {
                Err(err) => break SessionEnd::Disconnected(err),
                Ok(frame) if frame.is_heartbeat() => {
                    if let Err(err) = write_shared(&writer, b"NOP\n").await {
                        break SessionEnd::Disconnected(err);
                    }
                }
                Ok(Frame::Response(data)) => {
                    debug!(response = %String::from_utf8_lossy(&data), "nsqd response");
                }
                Ok(Frame::Error(data)) => {
                    let err = broker_error(&data);
                    if is_fatal(&err) {
                        break SessionEnd::Rejected(err);
                    }
                    warn!(error = %err, "nsqd reported an error");
                }
                Ok(Frame::Message(message)) => {
                    if tx.send(message).await.is_err() {
                        break SessionEnd::Disconnected(protocol_error(
                            "message worker stopped".to_string(),
                        ));
                    }
                }
            }
        };

        drop(tx);
        match end {
            SessionEnd::Stopped => {
                let _ = worker.await;
            }
            _ => worker.abort(),
        }
        end
    }
}

/// Run the handler for each message in order and acknowledge it.
async fn process_messages(
    mut messages: mpsc::Receiver<WireMessage>,
    handler: Arc<dyn NsqMessageHandler>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    base_delay: Duration,
) {
    while let Some(message) = messages.recv().await {
        let command = match handler.handle_message(message.body.clone()).await {
            Ok(()) => finish_command(&message.id),
            Err(err) => {
                let delay = requeue_delay(base_delay, message.attempts);
                warn!(
                    attempts = message.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "requeueing nsq message"
                );
                requeue_command(&message.id, delay)
            }
        };

        if let Err(err) = write_shared(&writer, &command).await {
            warn!(error = %err, "acknowledging nsq message");
            break;
        }
    }
}

// ============================================================================
// Producer
// ============================================================================

struct ClientProducer {
    address: String,
    dial_timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

#[async_trait]
impl NsqProducer for ClientProducer {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<(), QueueError> {
        let mut slot = self.connection.lock().await;
        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => Connection::open(&self.address, self.dial_timeout).await?,
        };

        let result = connection.publish(topic, &body).await;
        if result.is_ok() {
            *slot = Some(connection);
        }
        result
    }
}
