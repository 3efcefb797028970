//! Integration tests for the in-process backend
//!
//! These tests verify:
//! - Payloads published on one handler reach a consumer on the same host
//! - Failed messages come back after the requeue delay
//! - The delete override decides whether a message is requeued

mod common;

use bytes::Bytes;
use common::{collect, init_tracing, next_delivery};
use queue_mux::providers::{MemoryBackend, MemoryBroker};
use queue_mux::{QueueBackend, QueueHandler, QueueUri};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn isolated_backend() -> MemoryBackend {
    MemoryBackend::new(Arc::new(MemoryBroker::new()))
}

async fn open(backend: &MemoryBackend, uri: &str) -> QueueHandler {
    backend
        .queue(&QueueUri::parse(uri).unwrap())
        .await
        .expect("memory queue should open")
}

/// Register a handler that reports each attempt and answers with `respond`.
fn attempts_with<F>(
    handler: &QueueHandler,
    respond: F,
) -> (Arc<AtomicUsize>, mpsc::UnboundedReceiver<tokio::time::Instant>)
where
    F: Fn(&queue_mux::MessageContext, usize) -> Result<(), queue_mux::HandlerError>
        + Send
        + Sync
        + 'static,
{
    let attempts = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::unbounded_channel();
    let counter = Arc::clone(&attempts);
    handler.add_handler(move |ctx, _data| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let result = respond(&ctx, attempt);
        let _ = tx.send(tokio::time::Instant::now());
        async move { result }
    });
    (attempts, rx)
}

#[tokio::test]
async fn test_published_payload_reaches_consumer() {
    init_tracing();
    let backend = isolated_backend();

    let producer = open(&backend, "mem://host1/").await;
    producer.publish(r#"{"test":1}"#, &[]).await.unwrap();

    let consumer = open(&backend, "mem://host1/").await;
    let mut deliveries = collect(&consumer);
    consumer.start().unwrap();

    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.data, Bytes::from_static(br#"{"test":1}"#));
    assert!(!delivery.correlation_id.is_empty());

    producer.close();
    consumer.close();
}

/// Handlers bound to different hosts never see each other's messages.
#[tokio::test]
async fn test_hosts_are_separate_channels() {
    init_tracing();
    let backend = isolated_backend();

    let billing = open(&backend, "mem://billing").await;
    let shipping = open(&backend, "mem://shipping").await;
    let mut billing_deliveries = collect(&billing);
    let mut shipping_deliveries = collect(&shipping);
    billing.start().unwrap();
    shipping.start().unwrap();

    billing.publish("\"invoice\"", &[]).await.unwrap();
    shipping.publish("\"parcel\"", &[]).await.unwrap();

    assert_eq!(
        next_delivery(&mut billing_deliveries).await.data,
        Bytes::from_static(b"\"invoice\"")
    );
    assert_eq!(
        next_delivery(&mut shipping_deliveries).await.data,
        Bytes::from_static(b"\"parcel\"")
    );
    assert!(billing_deliveries.try_recv().is_err());
    assert!(shipping_deliveries.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_failed_message_redelivered_after_delay() {
    init_tracing();
    let backend = isolated_backend();
    let handler = open(&backend, "mem://retries").await;
    let (attempts, mut seen) = attempts_with(&handler, |_ctx, attempt| {
        if attempt == 1 {
            Err("first attempt fails".into())
        } else {
            Ok(())
        }
    });
    handler.start().unwrap();

    handler.publish("{}", &[]).await.unwrap();
    let first = seen.recv().await.unwrap();
    let second = seen.recv().await.unwrap();
    assert!(second - first >= Duration::from_secs(10));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    handler.close();
}

/// A handler can drop a message it failed to process.
#[tokio::test(start_paused = true)]
async fn test_delete_override_drops_failed_message() {
    init_tracing();
    let backend = isolated_backend();
    let handler = open(&backend, "mem://poison").await;
    let (attempts, mut seen) = attempts_with(&handler, |ctx, _attempt| {
        ctx.set_message_delete(true);
        Err("poison message".into())
    });
    handler.start().unwrap();

    handler.publish("{}", &[]).await.unwrap();
    seen.recv().await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    handler.close();
}

/// A handler can keep a message it processed successfully.
#[tokio::test(start_paused = true)]
async fn test_delete_override_keeps_successful_message() {
    init_tracing();
    let backend = isolated_backend();
    let handler = open(&backend, "mem://keep").await;
    let (attempts, mut seen) = attempts_with(&handler, |ctx, attempt| {
        if attempt == 1 {
            ctx.set_message_delete(false);
        }
        Ok(())
    });
    handler.start().unwrap();

    handler.publish("{}", &[]).await.unwrap();
    seen.recv().await.unwrap();
    seen.recv().await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    handler.close();
}
