// src/rabbitmq/transport/mod.rs
//
// Boundary with the broker. `ChannelOps` is one raw, per-connection channel;
// `BrokerTransport` owns the connection, hands out `ManagedChannel`s and
// replays their setup procedures whenever it attaches a fresh raw channel.

mod amqp;
mod memory;

pub use amqp::AmqpTransport;
pub use memory::MemoryTransport;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;

use super::channel_manager::ManagedChannel;
use super::errors::Result;
use super::message::PublishOptions;

/// Queue persistence policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Broker answer to a queue assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    pub consumer_count: u32,
    pub message_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Confirmed,
    /// The broker could not route the message and handed it back.
    Returned,
}

/// A delivery as the broker hands it over, before decoding.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: HashMap<String, String>,
    pub redelivered: bool,
}

pub type DeliveryHandler = Arc<dyn Fn(RawDelivery) + Send + Sync>;

/// Primitive operations of one live broker channel.
#[async_trait]
pub trait ChannelOps: Send + Sync {
    fn is_open(&self) -> bool;

    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<QueueInfo>;

    async fn prefetch(&self, count: u16) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str, handler: DeliveryHandler) -> Result<String>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<PublishOutcome>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<RawDelivery>>;

    async fn close(&self) -> Result<()>;
}

/// Idempotent procedure run against every raw channel a `ManagedChannel`
/// is attached to.
pub type SetupFn = Arc<dyn Fn(Arc<dyn ChannelOps>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub fn setup_fn<F, Fut>(f: F) -> SetupFn
where
    F: Fn(Arc<dyn ChannelOps>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |channel| Box::pin(f(channel)))
}

pub struct ChannelSpec {
    pub name: String,
    pub json: bool,
    pub setup: Option<SetupFn>,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            json: true,
            setup: None,
        }
    }

    pub fn with_setup(mut self, setup: SetupFn) -> Self {
        self.setup = Some(setup);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { url: String },
    Disconnected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Closed { reason: String },
    Errored { reason: String },
    MessageDropped { queue: String },
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Registers a channel and starts attaching it in the background. The
    /// receiver is subscribed before anything happens, so it sees the first
    /// `Opened`/`Errored`.
    fn create_channel(&self, spec: ChannelSpec) -> (Arc<ManagedChannel>, broadcast::Receiver<ChannelEvent>);

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    async fn close(&self) -> Result<()>;
}

/// Channels a transport must re-attach after reconnecting.
#[derive(Default)]
pub(crate) struct ChannelSet {
    channels: Mutex<Vec<Weak<ManagedChannel>>>,
}

impl ChannelSet {
    pub(crate) fn register(&self, channel: &Arc<ManagedChannel>) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.push(Arc::downgrade(channel));
        }
    }

    pub(crate) fn live(&self) -> Vec<Arc<ManagedChannel>> {
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(_) => return Vec::new(),
        };
        channels.retain(|weak| weak.upgrade().map_or(false, |c| !c.is_closed()));
        channels.iter().filter_map(Weak::upgrade).collect()
    }
}
