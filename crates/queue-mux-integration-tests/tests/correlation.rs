//! Integration tests for correlation ID propagation
//!
//! These tests verify:
//! - A correlation ID set on publish reaches the consumer
//! - A consumer can forward the ID to the messages it publishes
//! - Publishing without an ID generates one

mod common;

use common::{collect, init_tracing, next_delivery, LoopbackSqs};
use queue_mux::providers::SqsBackend;
use queue_mux::{
    with_correlation_id, HandlerError, PublishOptions, QueueBackend, QueueHandler,
    QueueMuxConfig, QueueUri,
};
use std::sync::Arc;

fn sqs_backend(sqs: Arc<LoopbackSqs>) -> SqsBackend {
    let mut config = QueueMuxConfig::default();
    config.sqs.wait_time_seconds = 1;
    config.sqs.poll_backoff_ms = 10;
    SqsBackend::with_api(sqs, &config)
}

async fn open(backend: &SqsBackend, uri: &str) -> QueueHandler {
    backend
        .queue(&QueueUri::parse(uri).unwrap())
        .await
        .expect("sqs queue should open")
}

#[tokio::test]
async fn test_explicit_correlation_id_reaches_consumer() {
    init_tracing();
    let backend = sqs_backend(Arc::new(LoopbackSqs::default()));

    let consumer = open(&backend, "sqs://orders").await;
    let mut deliveries = collect(&consumer);
    consumer.start().unwrap();

    let producer = open(&backend, "sqs://orders").await;
    producer
        .publish("{\"order\":1}", &[with_correlation_id("corr-1")])
        .await
        .unwrap();

    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.correlation_id, "corr-1");
    assert_eq!(delivery.data.as_ref(), b"{\"order\":1}");

    producer.close();
    consumer.close();
}

/// The last non-empty ID among the publish options wins.
#[tokio::test]
async fn test_merged_options_last_id_wins() {
    init_tracing();
    let backend = sqs_backend(Arc::new(LoopbackSqs::default()));

    let consumer = open(&backend, "sqs://orders").await;
    let mut deliveries = collect(&consumer);
    consumer.start().unwrap();

    consumer
        .publish(
            "{}",
            &[
                with_correlation_id("one"),
                with_correlation_id("two"),
                with_correlation_id(""),
            ],
        )
        .await
        .unwrap();

    assert_eq!(next_delivery(&mut deliveries).await.correlation_id, "two");
    consumer.close();
}

#[tokio::test]
async fn test_generated_correlation_id() {
    init_tracing();
    let backend = sqs_backend(Arc::new(LoopbackSqs::default()));

    let consumer = open(&backend, "sqs://orders").await;
    let mut deliveries = collect(&consumer);
    consumer.start().unwrap();

    consumer.publish("{}", &[]).await.unwrap();
    consumer.publish("{}", &[]).await.unwrap();

    let first = next_delivery(&mut deliveries).await.correlation_id;
    let second = next_delivery(&mut deliveries).await.correlation_id;
    assert_eq!(first.len(), 36);
    assert_ne!(first, second);
    consumer.close();
}

/// A consumer forwards the incoming ID to a follow-up message on another queue.
#[tokio::test]
async fn test_correlation_id_forwarded_downstream() {
    init_tracing();
    let sqs = Arc::new(LoopbackSqs::default());
    let backend = sqs_backend(Arc::clone(&sqs));

    let shipments_out = open(&backend, "sqs://shipments").await;
    let orders = open(&backend, "sqs://orders").await;
    orders.add_handler(move |ctx, data| {
        let shipments_out = shipments_out.clone();
        async move {
            shipments_out
                .publish(data, &[PublishOptions::with_correlation_id_from(&ctx)])
                .await
                .map_err(HandlerError::from)
        }
    });
    orders.start().unwrap();

    let shipments_in = open(&backend, "sqs://shipments").await;
    let mut shipments = collect(&shipments_in);
    shipments_in.start().unwrap();

    let producer = open(&backend, "sqs://orders").await;
    producer
        .publish("{\"order\":42}", &[with_correlation_id("trace-42")])
        .await
        .unwrap();

    let delivery = next_delivery(&mut shipments).await;
    assert_eq!(delivery.correlation_id, "trace-42");
    assert_eq!(delivery.data.as_ref(), b"{\"order\":42}");
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !sqs.deleted().contains(&"receipt-0".to_string()) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("forwarded order should be deleted");

    producer.close();
    orders.close();
    shipments_in.close();
}
