// src/rabbitmq/mod.rs
// Queue lifecycle, publish/subscribe and request/reply on top of a broker transport

pub mod errors;
pub mod connection;
pub mod events;
pub mod message;
pub mod transport;

mod channel_manager;
mod client;
mod publisher;
mod queue_manager;
mod registry;
mod request_response;
mod subscriber;

// Re-export specific items to simplify imports elsewhere
pub use channel_manager::{ManagedChannel, SetupId};
pub use client::MessagingClient;
pub use connection::ConnectionManager;
pub use errors::{RabbitMQError, Result};
pub use events::{Event, EventKind, EventSink, MemorySink, Reporter, TracingSink};
pub use message::{Content, InboundMessage, PublishOptions};
pub use publisher::{ErrorHandling, Publisher};
pub use queue_manager::{QueueManager, QueueRecord};
pub use registry::{ChannelRegistry, DEFAULT_CHANNEL};
pub use request_response::{RpcEngine, RpcServer};
pub use subscriber::Subscriber;
pub use transport::{
    AmqpTransport, BrokerTransport, ChannelEvent, ChannelOps, ConnectionEvent, MemoryTransport, QueueOptions,
};
