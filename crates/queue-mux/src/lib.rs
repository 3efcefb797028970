//! # Queue Mux
//!
//! Transport-agnostic message queue handling. Producers and consumers work
//! with one [`QueueHandler`] type whether the broker behind it is AWS SQS,
//! NSQ or an in-process channel; the connection URI picks the backend.
//!
//! This library provides:
//! - The handler engine: bounded in/out buffers, a handler chain and the
//!   start/close lifecycle
//! - A per-message propagation context carrying the correlation ID and a
//!   delete override
//! - A [`Registry`] resolving `scheme://...` URIs to backends
//! - Backends for `sqs`, `nsqd`, `nsqlookupd` and `mem`
//! - A JSON-typed view over any handler ([`TypedQueue`])
//!
//! ## Module Organization
//!
//! - [`handler`] - The queue handler engine
//! - [`context`] - Correlation metadata and delete disposition
//! - [`message`] - Messages and their outcome slots
//! - [`registry`] - Scheme to backend lookup
//! - [`providers`] - Backend implementations
//! - [`typed`] - JSON encode/decode over a handler
//! - [`config`] - Layered configuration
//! - [`error`] - Error types
//!
//! ## Example
//!
//! ```rust,no_run
//! use queue_mux::{default_registry, PublishOptions, QueueMuxConfig};
//!
//! # async fn example() -> Result<(), queue_mux::QueueError> {
//! let config = QueueMuxConfig::load(None)?;
//! let registry = default_registry(&config)?;
//!
//! let orders = registry.queue("sqs://orders").await?;
//! orders.add_handler(|ctx, data| async move {
//!     let follow_up = PublishOptions::with_correlation_id_from(&ctx);
//!     println!("{} bytes, correlation {:?}", data.len(), follow_up.correlation_id);
//!     Ok(())
//! });
//! orders.start()?;
//! # Ok(())
//! # }
//! ```

// Module declarations
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod message;
pub mod metrics;
pub mod providers;
pub mod registry;
pub mod typed;
pub mod uri;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// Re-export commonly used types at crate root for convenience
pub use config::{BodyEncoding, MemoryConfig, NsqConfig, QueueMuxConfig, SqsConfig};
pub use context::{with_correlation_id, Disposition, MessageContext, PublishOptions};
pub use error::{ConfigurationError, HandlerError, QueueError};
pub use handler::{OutgoingMessages, QueueHandler, ShutdownSignal};
pub use message::{Outcome, OutcomeSender, QueueMessage};
pub use metrics::{NoOpQueueMetrics, QueueMetrics};
pub use registry::{QueueBackend, Registry};
pub use typed::{TypedMessageError, TypedQueue};
pub use uri::QueueUri;

use providers::{
    MemoryBackend, MemoryBroker, NsqBackend, SqsBackend, MEMORY_SCHEME, NSQD_SCHEME,
    NSQLOOKUPD_SCHEME, SQS_SCHEME,
};
use std::sync::Arc;

/// Build a registry with every built-in backend.
///
/// `mem` uses the process-wide [`MemoryBroker::global`], so handlers from
/// different registries in one process share in-memory channels.
pub fn default_registry(config: &QueueMuxConfig) -> Result<Registry, QueueError> {
    config.validate()?;

    let mut registry = Registry::new();
    registry.register(
        MEMORY_SCHEME,
        Arc::new(MemoryBackend::from_config(MemoryBroker::global(), config)),
    );
    registry.register(SQS_SCHEME, Arc::new(SqsBackend::from_config(config)?));
    registry.register(NSQD_SCHEME, Arc::new(NsqBackend::from_config(config, false)?));
    registry.register(
        NSQLOOKUPD_SCHEME,
        Arc::new(NsqBackend::from_config(config, true)?),
    );
    Ok(registry)
}
