//! Tests for the crate-level registry construction.

use super::*;

#[tokio::test]
async fn test_default_registry_registers_builtin_backends() {
    let registry = default_registry(&QueueMuxConfig::default()).unwrap();

    assert_eq!(registry.schemes(), vec!["mem", "nsqd", "nsqlookupd", "sqs"]);
}

#[tokio::test]
async fn test_default_registry_rejects_invalid_config() {
    let config = QueueMuxConfig {
        buffer_size: 0,
        ..Default::default()
    };

    assert!(matches!(
        default_registry(&config),
        Err(QueueError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_default_registry_resolves_memory_queue() {
    let registry = default_registry(&QueueMuxConfig::default()).unwrap();

    let handler = registry.queue("mem://lib-tests-default").await.unwrap();
    assert_eq!(handler.uri(), "mem://lib-tests-default");
    handler.close();
}

#[tokio::test]
async fn test_unregistered_scheme_rejected() {
    let registry = default_registry(&QueueMuxConfig::default()).unwrap();

    match registry.queue("kafka://topic").await {
        Err(QueueError::UnknownScheme { scheme }) => assert_eq!(scheme, "kafka"),
        other => panic!("Expected UnknownScheme error, got: {:?}", other),
    }
}
