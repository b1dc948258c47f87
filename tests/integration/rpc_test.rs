use anyhow::anyhow;
use rust_rabbit_rpc::rabbitmq::{
    ErrorHandling, InboundMessage, PublishOptions, RabbitMQError, RpcEngine, RpcServer,
};
use rust_rabbit_rpc::RpcConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::common::{eventually, memory_client, Harness};

#[derive(Debug, Serialize, Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Sum {
    total: i64,
}

fn rpc_config() -> RpcConfig {
    RpcConfig {
        request_queue: "math.requests".to_string(),
        reply_queue: "math.replies".to_string(),
        request_timeout_ms: None,
    }
}

async fn start_adder(harness: &Harness) -> String {
    RpcServer::new(harness.client.clone(), &rpc_config().request_queue)
        .serve(|request: Add| async move {
            if request.a < 0 {
                return Err(anyhow!("negative operand"));
            }
            Ok(Sum {
                total: request.a + request.b,
            })
        })
        .await
        .unwrap()
}

async fn ready_engine(harness: &Harness) -> Arc<RpcEngine> {
    let engine = Arc::new(RpcEngine::new(harness.client.clone(), rpc_config()));
    engine.init().await.unwrap();
    engine
}

#[tokio::test]
async fn test_request_gets_its_reply() {
    let harness = memory_client();
    start_adder(&harness).await;
    let engine = ready_engine(&harness).await;

    let sum: Sum = engine.request(&Add { a: 2, b: 3 }).await.unwrap();
    assert_eq!(sum, Sum { total: 5 });
    assert_eq!(engine.pending_calls(), 0);

    let sent = harness.sink.matching("RPC request sent");
    assert_eq!(sent.len(), 1);
    let received = harness.sink.matching("RPC reply received");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].data["correlationId"], sent[0].data["correlationId"]);

    let options = harness.transport.queue_options("math.replies").unwrap();
    assert!(options.durable);
    assert!(!options.auto_delete);
}

#[tokio::test]
async fn test_init_is_idempotent() {
    let harness = memory_client();
    let engine = ready_engine(&harness).await;
    engine.init().await.unwrap();

    assert_eq!(harness.transport.consumer_count("math.replies"), 1);
}

#[tokio::test]
async fn test_concurrent_requests_resolve_out_of_order() {
    let harness = memory_client();
    let engine = ready_engine(&harness).await;

    // Hand-rolled responder that answers in reverse arrival order
    let (tx, mut rx) = mpsc::unbounded_channel();
    harness
        .client
        .subscribe("math.requests", move |request: InboundMessage<Value>| {
            let tx = tx.clone();
            async move {
                request.ack().await.unwrap();
                let _ = tx.send((
                    request.reply_to.clone().unwrap(),
                    request.correlation_id.clone().unwrap(),
                    request.content.decoded().cloned().unwrap(),
                ));
            }
        })
        .await
        .unwrap();

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.request::<_, Value>(&json!({ "m": 1 })).await })
    };
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.request::<_, Value>(&json!({ "m": 2 })).await })
    };

    let mut received = Vec::new();
    for _ in 0..2 {
        let request = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        received.push(request);
    }
    assert_eq!(engine.pending_calls(), 2);

    for (reply_to, correlation_id, body) in received.into_iter().rev() {
        harness
            .client
            .send(
                &reply_to,
                &json!({ "echo": body }),
                PublishOptions::default().with_correlation_id(correlation_id),
                ErrorHandling::Propagate,
            )
            .await
            .unwrap();
    }

    assert_eq!(first.await.unwrap().unwrap(), json!({ "echo": { "m": 1 } }));
    assert_eq!(second.await.unwrap().unwrap(), json!({ "echo": { "m": 2 } }));
    assert_eq!(engine.pending_calls(), 0);
}

#[tokio::test]
async fn test_unmatched_reply_reported_once_and_consumer_survives() {
    let harness = memory_client();
    start_adder(&harness).await;
    let engine = ready_engine(&harness).await;

    harness
        .client
        .send(
            "math.replies",
            &json!({ "total": 0 }),
            PublishOptions::default().with_correlation_id("nobody-asked"),
            ErrorHandling::Propagate,
        )
        .await
        .unwrap();

    let sink = harness.sink.clone();
    assert!(eventually(|| !sink.matching("Callback not present").is_empty()).await);

    // Still answering, and the stray reply was acknowledged
    let sum: Sum = engine.request(&Add { a: 1, b: 1 }).await.unwrap();
    assert_eq!(sum.total, 2);

    let unmatched = harness.sink.matching("Callback not present");
    assert_eq!(unmatched.len(), 1);
    assert_eq!(unmatched[0].data["correlationId"], "nobody-asked");
    assert_eq!(harness.transport.message_count("math.replies"), 0);
    assert_eq!(harness.transport.unacked_count("math.replies"), 0);
}

#[tokio::test]
async fn test_timeout_removes_pending_call() {
    let harness = memory_client();
    let engine = ready_engine(&harness).await;

    let err = engine
        .request_with_timeout::<_, Value>(&json!({ "m": 1 }), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::TimeoutError(_)));
    assert_eq!(engine.pending_calls(), 0);

    // A caller-side timeout that drops the future cleans up too
    let dropped = tokio::time::timeout(
        Duration::from_millis(50),
        engine.request::<_, Value>(&json!({ "m": 2 })),
    )
    .await;
    assert!(dropped.is_err());
    assert_eq!(engine.pending_calls(), 0);
}

#[tokio::test]
async fn test_configured_timeout_applies_to_request() {
    let harness = memory_client();
    let config = RpcConfig {
        request_timeout_ms: Some(30),
        ..rpc_config()
    };
    let engine = RpcEngine::new(harness.client.clone(), config);
    engine.init().await.unwrap();

    let err = engine.request::<_, Value>(&json!({})).await.unwrap_err();
    assert!(matches!(err, RabbitMQError::TimeoutError(d) if d == Duration::from_millis(30)));
}

#[tokio::test]
async fn test_request_before_init_fails_and_leaves_nothing_pending() {
    let harness = memory_client();
    let engine = RpcEngine::new(harness.client.clone(), rpc_config());

    let err = engine.request::<_, Value>(&json!({})).await.unwrap_err();
    assert!(matches!(err, RabbitMQError::UnknownQueue(_)));
    assert_eq!(engine.pending_calls(), 0);
}

#[tokio::test]
async fn test_server_rejects_requests_it_cannot_answer() {
    let harness = memory_client();
    start_adder(&harness).await;

    // No reply_to or correlation id
    harness
        .client
        .publish("math.requests", &Add { a: 1, b: 2 }, PublishOptions::default(), ErrorHandling::Propagate)
        .await
        .unwrap();
    // Handler failure
    harness
        .client
        .publish(
            "math.requests",
            &Add { a: -1, b: 2 },
            PublishOptions::default()
                .with_correlation_id("c-1")
                .with_reply_to("math.replies"),
            ErrorHandling::Propagate,
        )
        .await
        .unwrap();
    // Undecodable
    harness
        .client
        .publish(
            "math.requests",
            "not a request",
            PublishOptions::default()
                .with_correlation_id("c-2")
                .with_reply_to("math.replies"),
            ErrorHandling::Propagate,
        )
        .await
        .unwrap();

    let sink = harness.sink.clone();
    assert!(eventually(|| sink.matching("Rejected").len() == 2 && sink.matching("RPC handler failed").len() == 1).await);

    let transport = harness.transport.clone();
    assert!(eventually(|| transport.unacked_count("math.requests") == 0).await);
    assert_eq!(harness.transport.message_count("math.requests"), 0);
}

#[tokio::test]
async fn test_server_stop_cancels_consumer() {
    let harness = memory_client();
    let server = RpcServer::new(harness.client.clone(), "math.requests");
    let tag = server
        .serve(|request: Add| async move {
            Ok::<_, anyhow::Error>(Sum {
                total: request.a + request.b,
            })
        })
        .await
        .unwrap();
    assert_eq!(harness.transport.consumer_count("math.requests"), 1);

    server.stop(&tag).await.unwrap();
    assert_eq!(harness.transport.consumer_count("math.requests"), 0);
    assert!(harness.client.consumer_tags("math.requests").is_empty());
}
