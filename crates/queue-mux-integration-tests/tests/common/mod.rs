//! Common test utilities for queue-mux integration tests
//!
//! This module provides:
//! - Tracing setup writing through the test harness
//! - A loopback `SqsApi` that delivers sent messages back to receivers
//! - Helpers for collecting deliveries from a handler

use async_trait::async_trait;
use bytes::Bytes;
use queue_mux::providers::{SqsApi, SqsMessage};
use queue_mux::{MessageContext, QueueError, QueueHandler};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a fmt subscriber once per test binary. `RUST_LOG` overrides the
/// default `warn` level.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Deliveries
// ============================================================================

/// One message as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
#[allow(dead_code)]
pub struct Delivery {
    pub correlation_id: String,
    pub data: Bytes,
}

/// Register a handler that forwards every message to the returned receiver.
#[allow(dead_code)]
pub fn collect(handler: &QueueHandler) -> mpsc::UnboundedReceiver<Delivery> {
    let (tx, rx) = mpsc::unbounded_channel();
    handler.add_handler(move |ctx: MessageContext, data| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(Delivery {
                correlation_id: ctx.correlation_id().to_string(),
                data,
            });
            Ok(())
        }
    });
    rx
}

/// Next delivery, failing the test after five seconds.
#[allow(dead_code)]
pub async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("delivery channel closed")
}

// ============================================================================
// Loopback SQS
// ============================================================================

/// Queue service double: every sent message becomes receivable on the same
/// queue URL.
#[derive(Default)]
#[allow(dead_code)]
pub struct LoopbackSqs {
    queues: Mutex<HashMap<String, VecDeque<SqsMessage>>>,
    deleted: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

#[allow(dead_code)]
impl LoopbackSqs {
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl SqsApi for LoopbackSqs {
    async fn get_queue_url(&self, queue_name: &str) -> Result<String, QueueError> {
        Ok(format!("https://sqs.test.local/000000000000/{}", queue_name))
    }

    async fn get_visibility_timeout(&self, _queue_url: &str) -> Result<Duration, QueueError> {
        Ok(Duration::from_secs(30))
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        wait: Duration,
        max_messages: u32,
    ) -> Result<Vec<SqsMessage>, QueueError> {
        let batch: Vec<SqsMessage> = {
            let mut queues = self.queues.lock().unwrap();
            let queue = queues.entry(queue_url.to_string()).or_default();
            let count = queue.len().min(max_messages as usize);
            queue.drain(..count).collect()
        };
        if batch.is_empty() {
            tokio::time::sleep(wait.min(Duration::from_millis(20))).await;
        }
        Ok(batch)
    }

    async fn delete_message(
        &self,
        _queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueError> {
        self.deleted
            .lock()
            .unwrap()
            .push(receipt_handle.to_string());
        Ok(())
    }

    async fn send_message(
        &self,
        queue_url: &str,
        body: &Bytes,
        correlation_id: &str,
    ) -> Result<String, QueueError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = SqsMessage {
            body: body.clone(),
            receipt_handle: format!("receipt-{}", id),
            correlation_id: (!correlation_id.is_empty()).then(|| correlation_id.to_string()),
        };
        self.queues
            .lock()
            .unwrap()
            .entry(queue_url.to_string())
            .or_default()
            .push_back(message);
        Ok(format!("message-{}", id))
    }
}
