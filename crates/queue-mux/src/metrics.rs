//! Metrics collection for queue handlers.
//!
//! The engine reports publish results, per-handler processing results and
//! per-message processing time through [`QueueMetrics`]. Implementations are
//! supplied by the embedding application (e.g. a Prometheus exporter); the
//! default is [`NoOpQueueMetrics`].
//!
//! # Examples
//!
//! ```rust
//! use queue_mux::metrics::{NoOpQueueMetrics, QueueMetrics};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let metrics: Arc<dyn QueueMetrics> = Arc::new(NoOpQueueMetrics);
//! metrics.record_publish("mem://orders", true);
//! metrics.record_processed("mem://orders", 0, false);
//! metrics.record_processing_time("mem://orders", Duration::from_millis(12));
//! ```

use std::time::Duration;

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;

/// Metrics collector for queue operations.
///
/// Recording is best-effort: implementations must never fail or block the
/// message flow.
pub trait QueueMetrics: Send + Sync {
    /// Record the result of one `publish` call.
    ///
    /// # Metrics Updated
    ///
    /// - `message_publish_success_total` or `message_publish_error_total`
    fn record_publish(&self, uri: &str, success: bool);

    /// Record the result of one handler invocation.
    ///
    /// `handler_index` is the handler's position in registration order.
    ///
    /// # Metrics Updated
    ///
    /// - `message_processed_success_total` or `message_processed_error_total`
    fn record_processed(&self, uri: &str, handler_index: usize, success: bool);

    /// Record how long one handler invocation took.
    ///
    /// # Metrics Updated
    ///
    /// - `message_process_time_milliseconds`: histogram observation
    fn record_processing_time(&self, uri: &str, duration: Duration);
}

/// Metrics collector that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpQueueMetrics;

impl QueueMetrics for NoOpQueueMetrics {
    fn record_publish(&self, _uri: &str, _success: bool) {
        // No-op
    }

    fn record_processed(&self, _uri: &str, _handler_index: usize, _success: bool) {
        // No-op
    }

    fn record_processing_time(&self, _uri: &str, _duration: Duration) {
        // No-op
    }
}
