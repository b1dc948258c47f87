// src/rabbitmq/client.rs

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

use super::errors::Result;
use super::events::{EventSink, TracingSink};
use super::message::{InboundMessage, PublishOptions};
use super::publisher::{ErrorHandling, Publisher};
use super::queue_manager::{QueueManager, QueueRecord};
use super::registry::ChannelRegistry;
use super::subscriber::Subscriber;
use super::transport::{AmqpTransport, BrokerTransport, QueueOptions};
use crate::config::BrokerConfig;

/// Everything an application needs to talk to the broker: queue declaration,
/// publishing and consuming over one transport.
pub struct MessagingClient {
    registry: Arc<ChannelRegistry>,
    queues: Arc<QueueManager>,
    publisher: Publisher,
    subscriber: Subscriber,
}

impl MessagingClient {
    pub fn new(transport: Arc<dyn BrokerTransport>, sink: Arc<dyn EventSink>) -> Self {
        let registry = Arc::new(ChannelRegistry::new(transport, sink));
        let queues = Arc::new(QueueManager::new(registry.clone()));
        Self {
            publisher: Publisher::new(queues.clone()),
            subscriber: Subscriber::new(queues.clone()),
            registry,
            queues,
        }
    }

    /// Connects to the configured broker in the background and reports
    /// through `tracing`.
    pub fn connect(config: &BrokerConfig) -> Self {
        Self::new(Arc::new(AmqpTransport::connect(config)), Arc::new(TracingSink))
    }

    pub fn registry(&self) -> Arc<ChannelRegistry> {
        self.registry.clone()
    }

    pub fn queues(&self) -> Arc<QueueManager> {
        self.queues.clone()
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.registry.sink()
    }

    pub async fn create_queue(&self, name: &str, options: QueueOptions) -> Result<QueueRecord> {
        self.queues.create_queue(name, options).await
    }

    pub fn queue(&self, name: &str) -> Result<QueueRecord> {
        self.queues.queue(name)
    }

    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        message: &T,
        options: PublishOptions,
        handling: ErrorHandling,
    ) -> Result<()> {
        self.publisher.publish(queue, message, options, handling).await
    }

    pub async fn send<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        message: &T,
        options: PublishOptions,
        handling: ErrorHandling,
    ) -> Result<()> {
        self.publisher.send(queue, message, options, handling).await
    }

    pub async fn subscribe<T, F, Fut>(&self, queue: &str, callback: F) -> Result<String>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(InboundMessage<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscriber.subscribe(queue, callback).await
    }

    pub async fn unsubscribe(&self, queue: &str, consumer_tag: &str) -> Result<()> {
        self.subscriber.unsubscribe(queue, consumer_tag).await
    }

    pub async fn get_message<T: DeserializeOwned>(&self, queue: &str) -> Result<InboundMessage<T>> {
        self.subscriber.get_message(queue).await
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.subscriber.consumer_tags(queue)
    }

    pub async fn close(&self) -> Result<()> {
        self.registry.close().await
    }
}
