// src/rabbitmq/subscriber.rs

use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::channel_manager::{ManagedChannel, SetupId};
use super::errors::{RabbitMQError, Result};
use super::events::Reporter;
use super::message::InboundMessage;
use super::queue_manager::QueueManager;
use super::transport::{setup_fn, ChannelOps, DeliveryHandler, RawDelivery};

struct ActiveConsumer {
    channel: Arc<ManagedChannel>,
    setup_id: SetupId,
    active: Arc<AtomicBool>,
}

pub struct Subscriber {
    queues: Arc<QueueManager>,
    consumers: Mutex<HashMap<(String, String), ActiveConsumer>>,
    reporter: Reporter,
}

/// Decodes each delivery and runs `callback` on its own task. Deliveries that
/// arrive once the consumer was cancelled go back to the queue.
fn delivery_handler<T, F, Fut>(
    raw: Arc<dyn ChannelOps>,
    callback: Arc<F>,
    active: Arc<AtomicBool>,
) -> DeliveryHandler
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(InboundMessage<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |delivery: RawDelivery| {
        let raw = raw.clone();
        let callback = callback.clone();
        let active = active.clone();
        tokio::spawn(async move {
            if !active.load(Ordering::SeqCst) {
                debug!(tag = delivery.delivery_tag, "Requeueing delivery for cancelled consumer");
                if let Err(e) = raw.nack(delivery.delivery_tag, true).await {
                    warn!(error = %e, "Failed to requeue delivery");
                }
                return;
            }
            callback(InboundMessage::from_delivery(delivery, raw)).await;
        });
    })
}

impl Subscriber {
    pub fn new(queues: Arc<QueueManager>) -> Self {
        let reporter = Reporter::new("subscriber", queues.registry().sink());
        Self {
            queues,
            consumers: Mutex::new(HashMap::new()),
            reporter,
        }
    }

    /// Starts consuming `queue` and returns the consumer tag. The consumer is
    /// part of the queue channel's setup, so it comes back with the same tag
    /// after every reconnect. Messages are never acknowledged implicitly.
    pub async fn subscribe<T, F, Fut>(&self, queue: &str, callback: F) -> Result<String>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(InboundMessage<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let record = self.queues.queue(queue)?;
        let tag = format!("{}.{}", queue, Uuid::new_v4());
        let active = Arc::new(AtomicBool::new(true));
        let callback = Arc::new(callback);

        let attach = {
            let queue = queue.to_string();
            let tag = tag.clone();
            let active = active.clone();
            setup_fn(move |raw| {
                let handler = delivery_handler(raw.clone(), callback.clone(), active.clone());
                let queue = queue.clone();
                let tag = tag.clone();
                async move { raw.consume(&queue, &tag, handler).await.map(|_| ()) }
            })
        };

        let setup_id = match record.channel.add_setup(attach).await {
            Ok(id) => id,
            Err(e) => {
                self.reporter
                    .error("Subscribe failed", json!({ "queue": queue, "error": e.to_string() }));
                return Err(e);
            }
        };

        if let Ok(mut consumers) = self.consumers.lock() {
            consumers.insert(
                (queue.to_string(), tag.clone()),
                ActiveConsumer {
                    channel: record.channel.clone(),
                    setup_id,
                    active,
                },
            );
        }

        self.reporter
            .success("Subscribed", json!({ "queue": queue, "consumerTag": tag }));
        Ok(tag)
    }

    /// Cancels the consumer `consumer_tag` on `queue`. Callbacks already
    /// running finish normally.
    pub async fn unsubscribe(&self, queue: &str, consumer_tag: &str) -> Result<()> {
        self.queues.queue(queue)?;

        let consumer = self
            .consumers
            .lock()
            .ok()
            .and_then(|mut consumers| consumers.remove(&(queue.to_string(), consumer_tag.to_string())))
            .ok_or_else(|| RabbitMQError::UnknownConsumer {
                queue: queue.to_string(),
                tag: consumer_tag.to_string(),
            })?;

        consumer.active.store(false, Ordering::SeqCst);
        consumer.channel.remove_setup(consumer.setup_id).await;

        // A disconnected channel has no consumer left to cancel
        if consumer.channel.is_connected() {
            if let Err(e) = consumer.channel.cancel(consumer_tag).await {
                self.reporter.error(
                    "Unsubscribe failed",
                    json!({ "queue": queue, "consumerTag": consumer_tag, "error": e.to_string() }),
                );
                return Err(e);
            }
        }

        self.reporter
            .success("Unsubscribed", json!({ "queue": queue, "consumerTag": consumer_tag }));
        Ok(())
    }

    /// Takes one message off `queue` through the default channel, already
    /// acknowledged. Fails with `EmptyQueue` when nothing is waiting.
    pub async fn get_message<T: DeserializeOwned>(&self, queue: &str) -> Result<InboundMessage<T>> {
        let channel = self.queues.registry().default_channel().await?;
        match channel.get(queue, true).await {
            Ok(Some((delivery, raw))) => {
                self.reporter.log("Message fetched", json!({ "queue": queue }));
                Ok(InboundMessage::pre_acknowledged(delivery, raw))
            }
            Ok(None) => {
                self.reporter.log("Queue empty", json!({ "queue": queue }));
                Err(RabbitMQError::EmptyQueue(queue.to_string()))
            }
            Err(e) => {
                self.reporter
                    .error("Get message failed", json!({ "queue": queue, "error": e.to_string() }));
                Err(e)
            }
        }
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.consumers
            .lock()
            .map(|consumers| {
                consumers
                    .keys()
                    .filter(|(q, _)| q == queue)
                    .map(|(_, tag)| tag.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}
