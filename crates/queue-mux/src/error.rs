//! Error types for queue operations.

use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by user-registered message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no handlers registered")]
    NoHandlers,

    #[error("queue backend with scheme '{scheme}' not found")]
    UnknownScheme { scheme: String },

    #[error("incorrect scheme '{actual}', should be {expected}")]
    InvalidScheme { expected: String, actual: String },

    #[error("invalid queue uri '{uri}': {message}")]
    InvalidUri { uri: String, message: String },

    #[error("queue handler for '{uri}' has already been started")]
    AlreadyStarted { uri: String },

    #[error("queue handler for '{uri}' is closed")]
    Closed { uri: String },

    #[error("message was dropped before its outcome was reported")]
    Abandoned,

    #[error("handling message: {0}")]
    Handler(HandlerError),

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl QueueError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NoHandlers => false,
            Self::UnknownScheme { .. } => false,
            Self::InvalidScheme { .. } => false,
            Self::InvalidUri { .. } => false,
            Self::AlreadyStarted { .. } => false,
            Self::Closed { .. } => false,
            Self::Abandoned => true,
            Self::Handler(_) => false,
            Self::QueueNotFound { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::ProviderError { .. } => true, // Broker-side failures are usually transient
            Self::Serialization(_) => false,
            Self::Configuration(_) => false,
        }
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ConnectionFailed { .. } => Some(Duration::from_secs(10)),
            Self::ProviderError { .. } => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    /// Wrap an arbitrary handler failure.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<HandlerError>,
    {
        Self::Handler(err.into())
    }

    pub(crate) fn invalid_uri(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            message: message.into(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
