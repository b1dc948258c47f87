use rust_rabbit_rpc::rabbitmq::{ErrorHandling, InboundMessage, PublishOptions, QueueOptions, RabbitMQError};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::common::{eventually, memory_client};

#[tokio::test]
async fn test_repeated_reconnects_keep_options_and_single_consumer() {
    let harness = memory_client();
    let options = QueueOptions {
        durable: true,
        auto_delete: false,
    };
    let record = harness.client.create_queue("events", options).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tag = harness
        .client
        .subscribe("events", move |message: InboundMessage<Value>| {
            let tx = tx.clone();
            async move {
                let _ = message.ack().await;
                let _ = tx.send(message.content);
            }
        })
        .await
        .unwrap();

    for _ in 0..5 {
        harness.transport.disconnect();
        assert!(!record.channel.is_connected());
        harness.transport.reconnect().await;
        assert!(record.channel.is_connected());
    }

    assert_eq!(harness.transport.queue_options("events"), Some(options));
    assert_eq!(harness.transport.consumer_count("events"), 1);
    assert_eq!(harness.client.consumer_tags("events"), vec![tag]);
    // Declaration plus one consumer
    assert_eq!(record.channel.setup_count().await, 2);

    harness
        .client
        .publish("events", &json!({ "after": "reconnect" }), PublishOptions::default(), ErrorHandling::Propagate)
        .await
        .unwrap();

    let content = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(content.decoded(), Some(&json!({ "after": "reconnect" })));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_transient_queue_is_declared_again_after_restart() {
    let harness = memory_client();
    let options = QueueOptions {
        durable: false,
        auto_delete: false,
    };
    harness.client.create_queue("scratch", options).await.unwrap();

    harness.transport.restart_broker();
    assert!(!harness.transport.queue_exists("scratch"));

    harness.transport.reconnect().await;
    assert_eq!(harness.transport.queue_options("scratch"), Some(options));
}

#[tokio::test]
async fn test_unacked_message_is_redelivered_after_reconnect() {
    let harness = memory_client();
    harness
        .client
        .create_queue("jobs", QueueOptions::default())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    harness
        .client
        .subscribe("jobs", move |message: InboundMessage<Value>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        })
        .await
        .unwrap();

    harness
        .client
        .publish("jobs", &json!({ "id": 1 }), PublishOptions::default(), ErrorHandling::Propagate)
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!first.redelivered);

    harness.transport.disconnect();
    // The raw channel it came from is gone
    assert!(first.ack().await.is_err());

    harness.transport.reconnect().await;
    let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(second.redelivered);
    second.ack().await.unwrap();

    let transport = harness.transport.clone();
    assert!(eventually(|| transport.unacked_count("jobs") == 0).await);
}

#[tokio::test]
async fn test_channel_events_follow_the_connection() {
    let harness = memory_client();
    harness
        .client
        .create_queue("jobs", QueueOptions::default())
        .await
        .unwrap();

    harness.transport.disconnect();
    harness.transport.reconnect().await;

    let sink = harness.sink.clone();
    assert!(eventually(|| sink.matching("Channel opened").len() == 2).await);
    assert_eq!(sink.matching("Channel closed").len(), 1);
    assert!(eventually(|| sink.matching("Connected to broker").len() == 1).await);
    assert_eq!(sink.matching("Disconnected from broker").len(), 1);
}

#[tokio::test]
async fn test_publish_while_disconnected_is_reported() {
    let harness = memory_client();
    harness
        .client
        .create_queue("jobs", QueueOptions::default())
        .await
        .unwrap();
    harness.transport.disconnect();

    harness
        .client
        .publish("jobs", &json!({}), PublishOptions::default(), ErrorHandling::Report)
        .await
        .unwrap();
    assert_eq!(harness.sink.matching("Publish failed").len(), 1);

    let err = harness
        .client
        .publish("jobs", &json!({}), PublishOptions::default(), ErrorHandling::Propagate)
        .await
        .unwrap_err();
    assert!(err.is_connectivity());
}

#[tokio::test]
async fn test_failed_redeclare_closes_channel_and_recovers() {
    let harness = memory_client();
    let record = harness
        .client
        .create_queue("jobs", QueueOptions::default())
        .await
        .unwrap();

    let err = harness
        .client
        .create_queue(
            "jobs",
            QueueOptions {
                durable: false,
                auto_delete: true,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::DeclarationError { .. }));

    let sink = harness.sink.clone();
    assert!(eventually(|| sink.matching("Channel closed").len() == 1).await);
    let channel = record.channel.clone();
    assert!(eventually(move || channel.is_connected()).await);
    assert!(eventually(|| sink.matching("Channel opened").len() == 2).await);
    assert_eq!(harness.transport.queue_options("jobs"), Some(QueueOptions::default()));

    harness
        .client
        .publish("jobs", &json!({ "still": "works" }), PublishOptions::default(), ErrorHandling::Propagate)
        .await
        .unwrap();
    let message = harness.client.get_message::<Value>("jobs").await.unwrap();
    assert_eq!(message.content.decoded(), Some(&json!({ "still": "works" })));
}
