pub mod config;
pub mod rabbitmq;

pub use config::{BrokerConfig, RpcConfig, RustRabbitConfig};
pub use rabbitmq::{
    ErrorHandling, InboundMessage, MessagingClient, PublishOptions, QueueOptions, RabbitMQError, RpcEngine, RpcServer,
};
