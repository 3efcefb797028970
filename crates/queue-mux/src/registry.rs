//! Backend registry mapping URI schemes to queue backends.
//!
//! The registry is built once at startup (see
//! [`default_registry`](crate::default_registry)) and used read-only
//! afterwards. Tests construct their own isolated registries.
//!
//! # Examples
//!
//! ```rust
//! use queue_mux::providers::{MemoryBackend, MemoryBroker};
//! use queue_mux::Registry;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let mut registry = Registry::new();
//! registry.register("mem", Arc::new(MemoryBackend::new(Arc::new(MemoryBroker::new()))));
//!
//! let handler = registry.queue("mem://orders").await?;
//! assert_eq!(handler.uri(), "mem://orders");
//! # Ok::<(), queue_mux::QueueError>(())
//! # }).unwrap();
//! ```

use crate::error::QueueError;
use crate::handler::QueueHandler;
use crate::uri::QueueUri;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;

// ============================================================================
// QueueBackend
// ============================================================================

/// A queue implementation selectable by URI scheme.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Build a handler for `uri` and spawn the backend's loops against it.
    ///
    /// The returned handler is not started; the caller registers handlers and
    /// calls [`QueueHandler::start`] when it wants to consume.
    async fn queue(&self, uri: &QueueUri) -> Result<QueueHandler, QueueError>;
}

// ============================================================================
// Registry
// ============================================================================

/// Scheme to backend lookup table.
#[derive(Clone, Default)]
pub struct Registry {
    backends: HashMap<String, Arc<dyn QueueBackend>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` for `scheme`, replacing any earlier registration.
    pub fn register(&mut self, scheme: impl Into<String>, backend: Arc<dyn QueueBackend>) {
        let scheme = scheme.into();
        if self.backends.insert(scheme.clone(), backend).is_some() {
            debug!(scheme = %scheme, "replaced queue backend registration");
        }
    }

    /// Whether a backend is registered for `scheme`.
    pub fn contains(&self, scheme: &str) -> bool {
        self.backends.contains_key(scheme)
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Resolve `uri` to a new handler wired to its backend.
    ///
    /// Every call produces an independent handler.
    pub async fn queue(&self, uri: &str) -> Result<QueueHandler, QueueError> {
        let parsed = QueueUri::parse(uri)?;
        let backend = self
            .backends
            .get(parsed.scheme())
            .ok_or_else(|| QueueError::UnknownScheme {
                scheme: parsed.scheme().to_string(),
            })?;
        backend.queue(&parsed).await
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("schemes", &self.schemes())
            .finish()
    }
}
