//! SQS client over the HTTP query API.
//!
//! Requests are signed with AWS Signature Version 4 when credentials are
//! configured and sent unsigned otherwise, which local emulators accept.
//! Responses are XML and parsed with `quick-xml`.
//!
//! Only the calls needed by [`SqsBackend`](super::SqsBackend) are
//! implemented: `GetQueueUrl`, `GetQueueAttributes`, `ReceiveMessage`,
//! `DeleteMessage` and `SendMessage`.

use super::sqs::{SqsApi, SqsMessage, CORRELATION_ID_ATTRIBUTE};
use crate::config::{BodyEncoding, SqsConfig};
use crate::error::{ConfigurationError, QueueError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "sqs_http_tests.rs"]
mod tests;

const API_VERSION: &str = "2012-11-05";

/// Largest message body the service accepts.
const MAX_MESSAGE_SIZE: usize = 256 * 1024;

// ============================================================================
// Error Types
// ============================================================================

/// SQS specific errors
#[derive(Debug, thiserror::Error)]
pub enum SqsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("SQS service error: {code}: {message}")]
    ServiceError { code: String, message: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Invalid message body: {0}")]
    InvalidBody(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl SqsError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authentication(_) => false,
            Self::NetworkError(_) => true,
            Self::ServiceError { .. } => true, // Most SQS errors are transient
            Self::QueueNotFound(_) => false,
            Self::InvalidReceipt(_) => false,
            Self::MessageTooLarge { .. } => false,
            Self::InvalidBody(_) => false,
            Self::ConfigurationError(_) => false,
            Self::MalformedResponse(_) => false,
        }
    }

    fn provider_error(code: &str, message: String) -> QueueError {
        QueueError::ProviderError {
            provider: "sqs".to_string(),
            code: code.to_string(),
            message,
        }
    }
}

impl From<SqsError> for QueueError {
    fn from(err: SqsError) -> Self {
        match err {
            SqsError::Authentication(msg) => SqsError::provider_error("Authentication", msg),
            SqsError::NetworkError(message) => QueueError::ConnectionFailed { message },
            SqsError::ServiceError { code, message } => SqsError::provider_error(&code, message),
            SqsError::QueueNotFound(queue_name) => QueueError::QueueNotFound { queue_name },
            SqsError::InvalidReceipt(msg) => SqsError::provider_error("InvalidReceiptHandle", msg),
            err @ SqsError::MessageTooLarge { .. } => {
                SqsError::provider_error("MessageTooLarge", err.to_string())
            }
            SqsError::InvalidBody(msg) => SqsError::provider_error("InvalidMessageContents", msg),
            SqsError::ConfigurationError(message) => {
                QueueError::Configuration(ConfigurationError::Invalid { message })
            }
            SqsError::MalformedResponse(msg) => SqsError::provider_error("MalformedResponse", msg),
        }
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer for request authentication
///
/// 1. Create canonical request (method, URI, query, headers, payload)
/// 2. Create string to sign (algorithm, timestamp, scope, request hash)
/// 3. Derive signing key (4-level HMAC chain)
/// 4. Calculate signature and build Authorization header
#[derive(Clone)]
struct AwsV4Signer {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
}

impl AwsV4Signer {
    fn new(access_key: String, secret_key: String, region: String) -> Self {
        Self {
            access_key,
            secret_key,
            region,
            service: "sqs".to_string(),
        }
    }

    /// Headers to add to a request: `Authorization`, `x-amz-date` and `host`.
    fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query_params: &HashMap<String, String>,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Result<HashMap<String, String>, SqsError> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let canonical_query_string = encode_query(query_params);

        // Canonical headers (must be sorted)
        let canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let signed_headers = "host;x-amz-date";

        let payload_hash = hex::encode(Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query_string, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm,
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp)?;

        let authorization_header = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.access_key, credential_scope, signed_headers, signature
        );

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), authorization_header);
        headers.insert("x-amz-date".to_string(), amz_date);
        headers.insert("host".to_string(), host.to_string());
        Ok(headers)
    }

    /// Derive the signing key from the secret and sign `string_to_sign`.
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> Result<String, SqsError> {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, self.service.as_bytes())?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        let signature = hmac_sha256(&k_signing, string_to_sign.as_bytes())?;

        Ok(hex::encode(signature))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SqsError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| SqsError::Authentication(format!("Invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sorted, percent-encoded `key=value` pairs.
fn encode_query(params: &HashMap<String, String>) -> String {
    let mut pairs = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs.join("&")
}

// ============================================================================
// SqsHttpClient
// ============================================================================

/// [`SqsApi`] implementation over HTTP.
pub struct SqsHttpClient {
    http_client: HttpClient,
    signer: Option<AwsV4Signer>,
    endpoint: String,
    host: String,
    body_encoding: BodyEncoding,
    queue_url_cache: RwLock<HashMap<String, String>>,
}

impl SqsHttpClient {
    /// Create a client from configuration.
    ///
    /// Requests are signed only when both the access key ID and the secret
    /// access key are configured.
    pub fn new(config: &SqsConfig) -> Result<Self, SqsError> {
        if config.region.is_empty() {
            return Err(SqsError::ConfigurationError(
                "Region cannot be empty".to_string(),
            ));
        }

        let signer = match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key), Some(secret_key)) => Some(AwsV4Signer::new(
                access_key.clone(),
                secret_key.clone(),
                config.region.clone(),
            )),
            _ => None,
        };

        let endpoint = config.endpoint_url().trim_end_matches('/').to_string();
        let parsed = url::Url::parse(&endpoint).map_err(|e| {
            SqsError::ConfigurationError(format!("Invalid endpoint '{}': {}", endpoint, e))
        })?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(SqsError::ConfigurationError(format!(
                    "Endpoint '{}' has no host",
                    endpoint
                )))
            }
        };

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| SqsError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            signer,
            endpoint,
            host,
            body_encoding: config.body_encoding,
            queue_url_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Issue one API action and return the response body.
    async fn call(
        &self,
        action: &str,
        mut params: HashMap<String, String>,
    ) -> Result<String, SqsError> {
        params.insert("Action".to_string(), action.to_string());
        params.insert("Version".to_string(), API_VERSION.to_string());

        let query = encode_query(&params);
        let url = format!("{}/?{}", self.endpoint, query);
        let mut request = self.http_client.post(&url);

        if let Some(signer) = &self.signer {
            let headers = signer.sign_request("POST", &self.host, "/", &params, "", &Utc::now())?;
            for (key, value) in headers {
                request = request.header(&key, value);
            }
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SqsError::NetworkError(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                SqsError::NetworkError(format!("Connection failed: {}", e))
            } else {
                SqsError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| SqsError::NetworkError(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_response(&response_body, status.as_u16()));
        }

        debug!(action = %action, "SQS request succeeded");
        Ok(response_body)
    }

    fn encode_body(&self, body: &Bytes) -> Result<String, SqsError> {
        match self.body_encoding {
            BodyEncoding::Base64 => Ok(STANDARD.encode(body)),
            BodyEncoding::Raw => String::from_utf8(body.to_vec())
                .map_err(|e| SqsError::InvalidBody(format!("Body is not valid UTF-8: {}", e))),
        }
    }

    fn decode_body(&self, body: String) -> Result<Bytes, SqsError> {
        match self.body_encoding {
            BodyEncoding::Base64 => STANDARD
                .decode(body.as_bytes())
                .map(Bytes::from)
                .map_err(|e| SqsError::MalformedResponse(format!("Base64 decode failed: {}", e))),
            BodyEncoding::Raw => Ok(Bytes::from(body)),
        }
    }
}

impl fmt::Debug for SqsHttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsHttpClient")
            .field("endpoint", &self.endpoint)
            .field("signed", &self.signer.is_some())
            .field("body_encoding", &self.body_encoding)
            .finish()
    }
}

#[async_trait]
impl SqsApi for SqsHttpClient {
    async fn get_queue_url(&self, queue_name: &str) -> Result<String, QueueError> {
        if let Some(url) = self.queue_url_cache.read().await.get(queue_name) {
            return Ok(url.clone());
        }

        let mut params = HashMap::new();
        params.insert("QueueName".to_string(), queue_name.to_string());
        let response = self
            .call("GetQueueUrl", params)
            .await
            .map_err(|err| match err {
                SqsError::QueueNotFound(_) => QueueError::QueueNotFound {
                    queue_name: queue_name.to_string(),
                },
                other => other.into(),
            })?;
        let queue_url = parse_single_value(&response, "QueueUrl")?;

        self.queue_url_cache
            .write()
            .await
            .insert(queue_name.to_string(), queue_url.clone());
        Ok(queue_url)
    }

    async fn get_visibility_timeout(&self, queue_url: &str) -> Result<Duration, QueueError> {
        let mut params = HashMap::new();
        params.insert("QueueUrl".to_string(), queue_url.to_string());
        params.insert("AttributeName.1".to_string(), "VisibilityTimeout".to_string());
        let response = self.call("GetQueueAttributes", params).await?;

        let attributes = parse_queue_attributes(&response)?;
        let seconds = attributes
            .get("VisibilityTimeout")
            .ok_or_else(|| {
                SqsError::MalformedResponse("VisibilityTimeout not found in response".to_string())
            })?
            .parse::<u64>()
            .map_err(|e| SqsError::MalformedResponse(format!("Invalid VisibilityTimeout: {}", e)))?;
        Ok(Duration::from_secs(seconds))
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        wait: Duration,
        max_messages: u32,
    ) -> Result<Vec<SqsMessage>, QueueError> {
        let mut params = HashMap::new();
        params.insert("QueueUrl".to_string(), queue_url.to_string());
        params.insert(
            "MaxNumberOfMessages".to_string(),
            max_messages.clamp(1, 10).to_string(), // AWS max is 10
        );
        params.insert(
            "WaitTimeSeconds".to_string(),
            wait.as_secs().min(20).to_string(), // AWS max is 20 seconds
        );
        params.insert(
            "MessageAttributeName.1".to_string(),
            CORRELATION_ID_ATTRIBUTE.to_string(),
        );
        let response = self.call("ReceiveMessage", params).await?;

        // An undecodable body is skipped and left for redelivery; the rest of
        // the batch is still returned.
        let messages = parse_receive_message_response(&response)?
            .into_iter()
            .filter_map(|raw| match self.decode_body(raw.body) {
                Ok(body) => Some(SqsMessage {
                    body,
                    receipt_handle: raw.receipt_handle,
                    correlation_id: raw.correlation_id,
                }),
                Err(err) => {
                    warn!(
                        queue_url = %queue_url,
                        receipt_handle = %raw.receipt_handle,
                        error = %err,
                        "Skipping message with undecodable body"
                    );
                    None
                }
            })
            .collect();
        Ok(messages)
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueError> {
        let mut params = HashMap::new();
        params.insert("QueueUrl".to_string(), queue_url.to_string());
        params.insert("ReceiptHandle".to_string(), receipt_handle.to_string());

        // DeleteMessage returns an empty result on success
        self.call("DeleteMessage", params).await?;
        Ok(())
    }

    async fn send_message(
        &self,
        queue_url: &str,
        body: &Bytes,
        correlation_id: &str,
    ) -> Result<String, QueueError> {
        let encoded = self.encode_body(body)?;
        if encoded.len() > MAX_MESSAGE_SIZE {
            return Err(SqsError::MessageTooLarge {
                size: encoded.len(),
                max_size: MAX_MESSAGE_SIZE,
            }
            .into());
        }

        let mut params = HashMap::new();
        params.insert("QueueUrl".to_string(), queue_url.to_string());
        params.insert("MessageBody".to_string(), encoded);

        // The service rejects empty attribute values.
        if !correlation_id.is_empty() {
            params.insert(
                "MessageAttribute.1.Name".to_string(),
                CORRELATION_ID_ATTRIBUTE.to_string(),
            );
            params.insert(
                "MessageAttribute.1.Value.StringValue".to_string(),
                correlation_id.to_string(),
            );
            params.insert(
                "MessageAttribute.1.Value.DataType".to_string(),
                "String".to_string(),
            );
        }

        let response = self.call("SendMessage", params).await?;
        Ok(parse_single_value(&response, "MessageId")?)
    }
}

// ============================================================================
// XML Parsing
// ============================================================================

enum XmlNode {
    Text(String),
    End,
}

/// Walk `xml`, reporting each text node and each closing tag together with
/// the path of element names leading to it.
fn walk_xml<F>(xml: &str, mut visit: F) -> Result<(), SqsError>
where
    F: FnMut(&[String], XmlNode) -> Result<(), SqsError>,
{
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| SqsError::MalformedResponse(format!("Failed to parse XML: {}", e)))?
                    .into_owned();
                visit(&path, XmlNode::Text(text))?;
            }
            Ok(Event::End(_)) => {
                visit(&path, XmlNode::End)?;
                path.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SqsError::MalformedResponse(format!(
                    "XML parsing error: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(())
}

fn path_ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len()
        && path[path.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(a, b)| a == b)
}

/// First text found inside an element named `element`.
fn parse_single_value(xml: &str, element: &str) -> Result<String, SqsError> {
    let mut found = None;
    walk_xml(xml, |path, node| {
        if let XmlNode::Text(text) = node {
            if found.is_none() && path_ends_with(path, &[element]) {
                found = Some(text);
            }
        }
        Ok(())
    })?;

    found.ok_or_else(|| SqsError::MalformedResponse(format!("{} not found in response", element)))
}

fn parse_queue_attributes(xml: &str) -> Result<HashMap<String, String>, SqsError> {
    let mut attributes = HashMap::new();
    let mut name: Option<String> = None;

    walk_xml(xml, |path, node| {
        if let XmlNode::Text(text) = node {
            if path_ends_with(path, &["Attribute", "Name"]) {
                name = Some(text);
            } else if path_ends_with(path, &["Attribute", "Value"]) {
                if let Some(name) = name.take() {
                    attributes.insert(name, text);
                }
            }
        }
        Ok(())
    })?;

    Ok(attributes)
}

/// A message as it appears in a ReceiveMessage response, body still encoded.
#[derive(Debug, Default)]
struct RawMessage {
    receipt_handle: Option<String>,
    body: String,
    correlation_id: Option<String>,
}

#[derive(Debug)]
struct ParsedMessage {
    receipt_handle: String,
    body: String,
    correlation_id: Option<String>,
}

fn parse_receive_message_response(xml: &str) -> Result<Vec<ParsedMessage>, SqsError> {
    let mut messages = Vec::new();
    let mut current = RawMessage::default();
    let mut attribute_name: Option<String> = None;

    walk_xml(xml, |path, node| {
        match node {
            XmlNode::Text(text) => {
                if path_ends_with(path, &["Message", "ReceiptHandle"]) {
                    current.receipt_handle = Some(text);
                } else if path_ends_with(path, &["Message", "Body"]) {
                    current.body = text;
                } else if path_ends_with(path, &["MessageAttribute", "Name"]) {
                    attribute_name = Some(text);
                } else if path_ends_with(path, &["MessageAttribute", "Value", "StringValue"])
                    && attribute_name.as_deref() == Some(CORRELATION_ID_ATTRIBUTE)
                {
                    current.correlation_id = Some(text);
                }
            }
            XmlNode::End => {
                if path_ends_with(path, &["MessageAttribute"]) {
                    attribute_name = None;
                } else if path_ends_with(path, &["ReceiveMessageResult", "Message"]) {
                    let raw = std::mem::take(&mut current);
                    let receipt_handle = raw.receipt_handle.ok_or_else(|| {
                        SqsError::MalformedResponse("Message without ReceiptHandle".to_string())
                    })?;
                    messages.push(ParsedMessage {
                        receipt_handle,
                        body: raw.body,
                        correlation_id: raw.correlation_id,
                    });
                }
            }
        }
        Ok(())
    })?;

    Ok(messages)
}

/// Map an error response to an [`SqsError`].
fn parse_error_response(xml: &str, status_code: u16) -> SqsError {
    let mut error_code = None;
    let mut error_message = None;

    let _ = walk_xml(xml, |path, node| {
        if let XmlNode::Text(text) = node {
            if path_ends_with(path, &["Error", "Code"]) {
                error_code = Some(text);
            } else if path_ends_with(path, &["Error", "Message"]) {
                error_message = Some(text);
            }
        }
        Ok(())
    });

    let code = error_code.unwrap_or_else(|| "Unknown".to_string());
    let message = error_message.unwrap_or_else(|| "Unknown error".to_string());

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            SqsError::QueueNotFound(message)
        }
        "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch" => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        "InvalidReceiptHandle" | "ReceiptHandleIsInvalid" => SqsError::InvalidReceipt(message),
        _ if status_code == 401 || status_code == 403 => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        _ => SqsError::ServiceError { code, message },
    }
}
