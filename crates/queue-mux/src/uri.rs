//! Connection URI parsing.
//!
//! Queue URIs have the shape `scheme://host[:port][/path][#fragment]`. The
//! scheme selects the backend; host, path and fragment are interpreted by the
//! backend (queue name, topic/channel pair, simulated broker key).

use crate::error::QueueError;
use std::fmt;
use std::str::FromStr;
use url::Url;

#[cfg(test)]
#[path = "uri_tests.rs"]
mod tests;

/// Parsed queue connection URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueUri {
    raw: String,
    url: Url,
}

impl QueueUri {
    /// Parse a connection URI.
    pub fn parse(uri: &str) -> Result<Self, QueueError> {
        let url = Url::parse(uri).map_err(|e| QueueError::invalid_uri(uri, e.to_string()))?;
        Ok(Self {
            raw: uri.to_string(),
            url,
        })
    }

    /// The URI exactly as supplied.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Host without port; empty when the URI has none.
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Host including the port when one is present (`host:port`).
    pub fn authority(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.host(), port),
            None => self.host().to_string(),
        }
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.url.fragment()
    }

    /// Fail with [`QueueError::InvalidScheme`] unless the scheme is one of `expected`.
    pub fn require_scheme(&self, expected: &[&str]) -> Result<(), QueueError> {
        if expected.contains(&self.scheme()) {
            return Ok(());
        }
        Err(QueueError::InvalidScheme {
            expected: expected.join(" or "),
            actual: self.scheme().to_string(),
        })
    }
}

impl fmt::Display for QueueUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for QueueUri {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
