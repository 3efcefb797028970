//! Configuration for queue backends.
//!
//! Configuration is layered (later sources override earlier ones):
//!
//! 1. Built-in defaults
//! 2. An optional YAML/TOML/JSON file passed to [`QueueMuxConfig::load`]
//! 3. Environment variables prefixed `QUEUE_MUX__` with `__` as the nesting
//!    separator, e.g. `QUEUE_MUX__SQS__REGION=eu-west-1`
//!
//! Every field carries a serde default, so an absent file and an empty
//! environment produce a valid configuration.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "QUEUE_MUX";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueMuxConfig {
    /// Capacity of each handler's incoming and outgoing buffers
    pub buffer_size: usize,

    /// Cloud queue (SQS) backend settings
    pub sqs: SqsConfig,

    /// Pub-sub (NSQ) backend settings
    pub nsq: NsqConfig,

    /// In-process backend settings
    pub memory: MemoryConfig,
}

impl Default for QueueMuxConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            sqs: SqsConfig::default(),
            nsq: NsqConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl QueueMuxConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let loaded: Self = config
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.buffer_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "buffer_size must be greater than zero".to_string(),
            });
        }
        self.sqs.validate()?;
        self.nsq.validate()
    }
}

// ============================================================================
// SQS
// ============================================================================

/// How message bodies are encoded on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    /// Body sent verbatim; must be valid UTF-8
    #[default]
    Raw,
    /// Base64, for binary payloads
    Base64,
}

/// SQS backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SqsConfig {
    /// AWS region
    pub region: String,

    /// Endpoint override, e.g. a local emulator (`http://localhost:4566`)
    pub endpoint: Option<String>,

    /// Access key ID for request signing
    pub access_key_id: Option<String>,

    /// Secret access key for request signing
    pub secret_access_key: Option<String>,

    /// Long-poll wait per receive call, in seconds (max 20)
    pub wait_time_seconds: u64,

    /// Pause after a failed receive call, in milliseconds
    pub poll_backoff_ms: u64,

    /// Messages requested per receive call (1-10)
    pub max_messages: u32,

    /// Message body encoding
    pub body_encoding: BodyEncoding,

    /// HTTP request timeout in seconds
    pub request_timeout_seconds: u64,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            wait_time_seconds: 10,
            poll_backoff_ms: 1000,
            max_messages: 10,
            body_encoding: BodyEncoding::default(),
            request_timeout_seconds: 30,
        }
    }
}

impl SqsConfig {
    pub fn poll_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_backoff_ms)
    }

    /// Endpoint URL, derived from the region unless overridden.
    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://sqs.{}.amazonaws.com", self.region))
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.region.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "sqs.region".to_string(),
            });
        }
        if !(1..=10).contains(&self.max_messages) {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "sqs.max_messages must be between 1 and 10, got {}",
                    self.max_messages
                ),
            });
        }
        if self.wait_time_seconds > 20 {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "sqs.wait_time_seconds must be at most 20, got {}",
                    self.wait_time_seconds
                ),
            });
        }
        Ok(())
    }
}

// ============================================================================
// NSQ
// ============================================================================

/// NSQ backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NsqConfig {
    /// Pause before retrying a failed connection, in seconds
    pub reconnect_backoff_seconds: u64,

    /// Messages the broker may push before one is acknowledged
    pub max_in_flight: u32,

    /// Base delay for negative acknowledgements, in milliseconds. Multiplied
    /// by the message's delivery attempt and capped at 15 minutes.
    pub requeue_delay_ms: u64,

    /// Interval between nsqlookupd queries, in seconds
    pub lookupd_poll_interval_seconds: u64,

    /// Timeout for connects and discovery requests, in seconds
    pub dial_timeout_seconds: u64,
}

impl Default for NsqConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_seconds: 10,
            max_in_flight: 1,
            requeue_delay_ms: 90_000,
            lookupd_poll_interval_seconds: 60,
            dial_timeout_seconds: 1,
        }
    }
}

impl NsqConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_seconds)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    pub fn lookupd_poll_interval(&self) -> Duration {
        Duration::from_secs(self.lookupd_poll_interval_seconds)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_seconds)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_in_flight == 0 {
            return Err(ConfigurationError::Invalid {
                message: "nsq.max_in_flight must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Memory
// ============================================================================

/// In-process backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Delay before a failed message is put back on its channel, in milliseconds
    pub requeue_delay_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            requeue_delay_ms: 10_000,
        }
    }
}

impl MemoryConfig {
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}
