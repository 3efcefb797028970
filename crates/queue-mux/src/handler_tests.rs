//! Tests for the queue handler engine.

use super::*;
use crate::context::with_correlation_id;
use std::sync::atomic::AtomicUsize;

// ============================================================================
// Test Helpers
// ============================================================================

const URI: &str = "mem://handler-tests";

fn create_handler() -> (QueueHandler, OutgoingMessages) {
    QueueHandler::new(URI, 10)
}

/// Metrics collector that remembers every call.
#[derive(Default)]
struct RecordingMetrics {
    publishes: Mutex<Vec<bool>>,
    processed: Mutex<Vec<(usize, bool)>>,
    timings: AtomicUsize,
}

impl QueueMetrics for RecordingMetrics {
    fn record_publish(&self, _uri: &str, success: bool) {
        self.publishes.lock().unwrap().push(success);
    }

    fn record_processed(&self, _uri: &str, handler_index: usize, success: bool) {
        self.processed.lock().unwrap().push((handler_index, success));
    }

    fn record_processing_time(&self, _uri: &str, _duration: Duration) {
        self.timings.fetch_add(1, Ordering::SeqCst);
    }
}

/// Drain the outgoing buffer, resolving each message with `result`.
fn spawn_fake_backend(
    mut outgoing: OutgoingMessages,
    fail_with: Option<&'static str>,
) -> tokio::task::JoinHandle<Vec<QueueMessageSummary>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(message) = outgoing.recv().await {
            seen.push(QueueMessageSummary {
                data: message.data.clone(),
                correlation_id: message.context.correlation_id().to_string(),
            });
            match fail_with {
                Some(reason) => message.fail(QueueError::handler(reason)),
                None => message.complete(),
            }
            if seen.len() == 1 {
                break;
            }
        }
        seen
    })
}

#[derive(Debug)]
struct QueueMessageSummary {
    data: Bytes,
    correlation_id: String,
}

// ============================================================================
// Receive
// ============================================================================

mod receive {
    use super::*;

    /// Receive with zero handlers fails fast without touching the buffer.
    #[tokio::test]
    async fn test_receive_without_handlers_fails_immediately() {
        let (handler, _outgoing) = create_handler();

        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            handler.receive(MessageContext::new(), Bytes::from_static(b"{}")),
        )
        .await
        .expect("receive should not block");

        assert!(matches!(outcome.await, Err(QueueError::NoHandlers)));
    }

    /// All handlers run in registration order and a success resolves Ok.
    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let (handler, _outgoing) = create_handler();
        let order = Arc::new(Mutex::new(Vec::new()));

        for index in 0..3 {
            let order = Arc::clone(&order);
            handler.add_handler(move |_ctx, _data| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(index);
                    Ok(())
                }
            });
        }
        handler.start().unwrap();

        let outcome = handler
            .receive(MessageContext::new(), Bytes::from_static(b"payload"))
            .await;

        assert!(outcome.await.is_ok());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    /// A failing handler does not short-circuit the rest of the chain.
    #[tokio::test]
    async fn test_failure_does_not_short_circuit_chain() {
        let (handler, _outgoing) = create_handler();
        let calls = Arc::new(AtomicUsize::new(0));

        for index in 0..4 {
            let calls = Arc::clone(&calls);
            handler.add_handler(move |_ctx, _data| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if index == 1 {
                        return Err("handler one failed".into());
                    }
                    Ok(())
                }
            });
        }
        handler.start().unwrap();

        let result = handler
            .receive(MessageContext::new(), Bytes::from_static(b"payload"))
            .await
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(QueueError::Handler(err)) => assert_eq!(err.to_string(), "handler one failed"),
            other => panic!("Expected Handler error, got: {:?}", other),
        }
    }

    /// The first failure is reported when several handlers fail.
    #[tokio::test]
    async fn test_first_failure_is_reported() {
        let (handler, _outgoing) = create_handler();
        handler
            .add_handler(|_ctx, _data| async { Err("first".into()) })
            .add_handler(|_ctx, _data| async { Err("second".into()) });
        handler.start().unwrap();

        let err = handler
            .receive(MessageContext::new(), Bytes::new())
            .await
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "handling message: first");
    }

    /// Handlers see the payload and the context they were given.
    #[tokio::test]
    async fn test_handler_receives_payload_and_context() {
        let (handler, _outgoing) = create_handler();
        let seen = Arc::new(Mutex::new(None));

        let seen_clone = Arc::clone(&seen);
        handler.add_handler(move |ctx, data| {
            let seen = Arc::clone(&seen_clone);
            async move {
                *seen.lock().unwrap() = Some((ctx.correlation_id().to_string(), data));
                Ok(())
            }
        });
        handler.start().unwrap();

        let ctx = MessageContext::default().with_options(with_correlation_id("corr-1"));
        handler
            .receive(ctx, Bytes::from_static(b"{\"test\":1}"))
            .await
            .await
            .unwrap();

        let (correlation_id, data) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(correlation_id, "corr-1");
        assert_eq!(data, Bytes::from_static(b"{\"test\":1}"));
    }

    /// A delete override set by a handler is visible to the caller's context.
    #[tokio::test]
    async fn test_handler_override_visible_after_processing() {
        let (handler, _outgoing) = create_handler();
        handler.add_handler(|ctx, _data| async move {
            ctx.set_message_delete(false);
            Ok(())
        });
        handler.start().unwrap();

        let ctx = MessageContext::new();
        handler.receive(ctx.clone(), Bytes::new()).await.await.unwrap();

        assert_eq!(ctx.message_delete(), Some(false));
    }

    /// Receive after shutdown reports the handler as closed.
    #[tokio::test]
    async fn test_receive_after_shutdown_reports_closed() {
        let (handler, _outgoing) = create_handler();
        handler.add_handler(|_ctx, _data| async { Ok(()) });
        handler.start().unwrap();
        handler.close();

        // Give the consume loop a chance to observe the done signal.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = handler.receive(MessageContext::new(), Bytes::new()).await.await;
        assert!(matches!(
            result,
            Err(QueueError::Closed { .. }) | Err(QueueError::Abandoned)
        ));
    }
}

// ============================================================================
// Publish
// ============================================================================

mod publish {
    use super::*;

    /// A successful send resolves the publish with Ok.
    #[tokio::test]
    async fn test_publish_success() {
        let (handler, outgoing) = create_handler();
        let backend = spawn_fake_backend(outgoing, None);

        handler
            .publish(Bytes::from_static(b"{\"test\":1}"), &[])
            .await
            .unwrap();

        let seen = backend.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].data, Bytes::from_static(b"{\"test\":1}"));
        assert!(!seen[0].correlation_id.is_empty());
    }

    /// A failed send resolves the publish with that failure.
    #[tokio::test]
    async fn test_publish_failure_is_returned() {
        let (handler, outgoing) = create_handler();
        let _backend = spawn_fake_backend(outgoing, Some("broker rejected message"));

        let err = handler.publish("payload", &[]).await.unwrap_err();
        assert_eq!(err.to_string(), "handling message: broker rejected message");
    }

    /// An explicit correlation ID is carried on the published message.
    #[tokio::test]
    async fn test_publish_uses_explicit_correlation_id() {
        let (handler, outgoing) = create_handler();
        let backend = spawn_fake_backend(outgoing, None);

        handler
            .publish(
                "payload",
                &[with_correlation_id("one"), with_correlation_id("two")],
            )
            .await
            .unwrap();

        let seen = backend.await.unwrap();
        assert_eq!(seen[0].correlation_id, "two");
    }

    /// Publishing with no backend loop left reports the handler as closed.
    #[tokio::test]
    async fn test_publish_without_backend_reports_closed() {
        let (handler, outgoing) = create_handler();
        drop(outgoing);

        let err = handler.publish("payload", &[]).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed { .. }));
    }

    /// A message dropped by the backend resolves as abandoned.
    #[tokio::test]
    async fn test_publish_dropped_by_backend_reports_abandoned() {
        let (handler, mut outgoing) = create_handler();
        tokio::spawn(async move {
            let message = outgoing.recv().await;
            drop(message);
        });

        let err = handler.publish("payload", &[]).await.unwrap_err();
        assert!(matches!(err, QueueError::Abandoned));
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (handler, _outgoing) = create_handler();
        handler.start().unwrap();

        assert!(matches!(
            handler.start(),
            Err(QueueError::AlreadyStarted { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_ready_after_start() {
        let (handler, _outgoing) = create_handler();
        let waiter = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.wait_ready().await })
        };

        handler.start().unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_ready_returns_false_when_closed_first() {
        let (handler, _outgoing) = create_handler();
        handler.close();
        assert!(!handler.wait_ready().await);
    }

    #[tokio::test]
    async fn test_close_latches_done_signal() {
        let (handler, _outgoing) = create_handler();
        let mut signal = handler.shutdown_signal();
        assert!(!signal.is_closed());
        assert!(!handler.is_closed());

        handler.close();

        tokio::time::timeout(Duration::from_millis(100), signal.closed())
            .await
            .expect("shutdown signal should resolve");
        assert!(signal.is_closed());
        assert!(handler.is_closed());
    }

    #[test]
    fn test_visibility_defaults_to_zero() {
        let (handler, _outgoing) = create_handler();
        assert_eq!(handler.visibility(), Duration::ZERO);

        handler.set_visibility(Duration::from_secs(30));
        assert_eq!(handler.visibility(), Duration::from_secs(30));
    }

    #[test]
    fn test_add_handler_chains() {
        let (handler, _outgoing) = create_handler();
        handler
            .add_handler(|_ctx, _data| async { Ok(()) })
            .add_handler(|_ctx, _data| async { Ok(()) });

        assert_eq!(handler.handler_count(), 2);
        assert_eq!(handler.uri(), URI);
    }
}

// ============================================================================
// Metrics
// ============================================================================

mod metrics {
    use super::*;

    #[tokio::test]
    async fn test_processing_metrics_recorded_per_handler() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (handler, _outgoing) = QueueHandler::with_metrics(URI, 10, metrics.clone());
        handler
            .add_handler(|_ctx, _data| async { Ok(()) })
            .add_handler(|_ctx, _data| async { Err("nope".into()) });
        handler.start().unwrap();

        let _ = handler.receive(MessageContext::new(), Bytes::new()).await.await;

        assert_eq!(
            *metrics.processed.lock().unwrap(),
            vec![(0, true), (1, false)]
        );
        assert_eq!(metrics.timings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_publish_metrics_recorded() {
        let metrics = Arc::new(RecordingMetrics::default());
        let (handler, outgoing) = QueueHandler::with_metrics(URI, 10, metrics.clone());
        let _backend = spawn_fake_backend(outgoing, None);

        handler.publish("payload", &[]).await.unwrap();

        assert_eq!(*metrics.publishes.lock().unwrap(), vec![true]);
    }
}
