use rust_rabbit_rpc::rabbitmq::{ErrorHandling, InboundMessage, PublishOptions, QueueOptions, RabbitMQError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::common::{eventually, memory_client};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Payload {
    a: u32,
}

#[tokio::test]
async fn test_create_queue_twice_for_every_option_pair() {
    let harness = memory_client();

    for durable in [true, false] {
        for auto_delete in [true, false] {
            let name = format!("queue-{}-{}", durable, auto_delete);
            let options = QueueOptions { durable, auto_delete };

            harness.client.create_queue(&name, options).await.unwrap();
            harness.client.create_queue(&name, options).await.unwrap();

            assert_eq!(harness.transport.queue_options(&name), Some(options));
            assert_eq!(harness.client.queue(&name).unwrap().options, options);
        }
    }
}

#[tokio::test]
async fn test_publish_then_subscribe_round_trip() {
    let harness = memory_client();
    harness
        .client
        .create_queue("orders", QueueOptions::default())
        .await
        .unwrap();

    harness
        .client
        .publish(
            "orders",
            &Payload { a: 1 },
            PublishOptions::default().with_header("source", "tests"),
            ErrorHandling::Propagate,
        )
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    harness
        .client
        .subscribe("orders", move |message: InboundMessage<Payload>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        })
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.content.decoded(), Some(&Payload { a: 1 }));
    assert_eq!(message.routing_key, "orders");
    assert_eq!(message.headers.get("source").map(String::as_str), Some("tests"));

    // Nothing is acknowledged implicitly
    assert_eq!(harness.transport.unacked_count("orders"), 1);
    message.ack().await.unwrap();
    assert_eq!(harness.transport.unacked_count("orders"), 0);

    let err = harness.client.get_message::<Payload>("orders").await.unwrap_err();
    assert!(matches!(err, RabbitMQError::EmptyQueue(_)));
}

#[tokio::test]
async fn test_get_message_takes_exactly_one() {
    let harness = memory_client();
    harness
        .client
        .create_queue("polls", QueueOptions::default())
        .await
        .unwrap();

    let err = harness.client.get_message::<Value>("polls").await.unwrap_err();
    assert!(matches!(err, RabbitMQError::EmptyQueue(_)));

    harness
        .client
        .send("polls", &json!({ "a": 1 }), PublishOptions::default(), ErrorHandling::Propagate)
        .await
        .unwrap();

    let message = harness.client.get_message::<Value>("polls").await.unwrap();
    assert_eq!(message.content.decoded(), Some(&json!({ "a": 1 })));
    // Fetched without ack; settling it again is a no-op
    message.ack().await.unwrap();

    let err = harness.client.get_message::<Value>("polls").await.unwrap_err();
    assert!(matches!(err, RabbitMQError::EmptyQueue(_)));

    assert_eq!(harness.sink.matching("Message sent").len(), 1);
    let fetched = harness.sink.matching("Message fetched");
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].data["queue"], "polls");
    assert_eq!(harness.sink.matching("Queue empty").len(), 2);
}

#[tokio::test]
async fn test_undecodable_payload_arrives_raw() {
    let harness = memory_client();
    harness
        .client
        .create_queue("orders", QueueOptions::default())
        .await
        .unwrap();

    harness
        .client
        .publish("orders", "not an order", PublishOptions::default(), ErrorHandling::Propagate)
        .await
        .unwrap();

    let message = harness.client.get_message::<Payload>("orders").await.unwrap();
    assert!(message.content.is_raw());
}

#[tokio::test]
async fn test_nack_with_requeue_redelivers() {
    let harness = memory_client();
    harness
        .client
        .create_queue("orders", QueueOptions::default())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    harness
        .client
        .subscribe("orders", move |message: InboundMessage<Payload>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        })
        .await
        .unwrap();

    harness
        .client
        .publish("orders", &Payload { a: 7 }, PublishOptions::default(), ErrorHandling::Propagate)
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!first.redelivered);
    first.nack(true).await.unwrap();

    let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(second.redelivered);
    assert_eq!(second.content.decoded(), Some(&Payload { a: 7 }));
    second.ack().await.unwrap();
}

#[tokio::test]
async fn test_delivery_after_unsubscribe_is_requeued() {
    let harness = memory_client();
    harness
        .client
        .create_queue("jobs", QueueOptions::default())
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let tag = harness
        .client
        .subscribe("jobs", move |message: InboundMessage<Value>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                let _ = message.ack().await;
            }
        })
        .await
        .unwrap();

    // The delivery is handed over here but its callback has not run yet
    harness
        .client
        .publish("jobs", &json!({ "n": 1 }), PublishOptions::default(), ErrorHandling::Propagate)
        .await
        .unwrap();
    harness.client.unsubscribe("jobs", &tag).await.unwrap();

    let transport = harness.transport.clone();
    assert!(eventually(|| transport.message_count("jobs") == 1).await);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.transport.unacked_count("jobs"), 0);
    assert_eq!(harness.transport.consumer_count("jobs"), 0);

    let message = harness.client.get_message::<Value>("jobs").await.unwrap();
    assert!(message.redelivered);
}

#[tokio::test]
async fn test_prefetch_keeps_one_message_in_flight() {
    let harness = memory_client();
    harness
        .client
        .create_queue("work", QueueOptions::default())
        .await
        .unwrap();

    for a in 0..3 {
        harness
            .client
            .publish("work", &Payload { a }, PublishOptions::default(), ErrorHandling::Propagate)
            .await
            .unwrap();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    harness
        .client
        .subscribe("work", move |message: InboundMessage<Payload>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        })
        .await
        .unwrap();

    for expected in 0..3 {
        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.content.decoded(), Some(&Payload { a: expected }));
        assert_eq!(harness.transport.unacked_count("work"), 1);
        assert!(rx.try_recv().is_err());
        message.ack().await.unwrap();
    }
}

#[tokio::test]
async fn test_send_to_undeclared_queue_reports_drop() {
    let harness = memory_client();

    harness
        .client
        .send("nobody-home", &json!({}), PublishOptions::default(), ErrorHandling::Report)
        .await
        .unwrap();

    let sink = harness.sink.clone();
    assert!(eventually(|| sink.matching("Message dropped").len() == 1).await);
}
