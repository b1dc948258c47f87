// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Queue declaration failed for '{queue}': {reason}")]
    DeclarationError { queue: String, reason: String },

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Queue '{0}' has not been created")]
    UnknownQueue(String),

    #[error("Consumer '{tag}' is not active on queue '{queue}'")]
    UnknownConsumer { queue: String, tag: String },

    #[error("No message available on queue '{0}'")]
    EmptyQueue(String),

    #[error("Callback not present for correlation id {0}")]
    UnmatchedReply(String),

    #[error("Request timed out after {0:?}")]
    TimeoutError(Duration),

    #[error("Response channel was closed unexpectedly")]
    ResponseChannelClosed,
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Errors that mean the broker link itself is gone, as opposed to a
    /// refusal of one specific operation.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RabbitMQError::ConnectionError(_) | RabbitMQError::ChannelError(_))
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::InvalidConnectionState(_) | LapinError::IOError(_) => {
                RabbitMQError::ConnectionError(error.to_string())
            }
            LapinError::InvalidChannelState(_) | LapinError::InvalidChannel(_) | LapinError::ChannelsLimitReached => {
                RabbitMQError::ChannelError(error.to_string())
            }
            _ => {
                // Protocol errors carry the reply text; classify on it like the broker reports it
                let error_text = error.to_string();
                if error_text.contains("connection") {
                    RabbitMQError::ConnectionError(error_text)
                } else if error_text.contains("ack") {
                    RabbitMQError::AckError(error_text)
                } else {
                    RabbitMQError::ChannelError(error_text)
                }
            }
        }
    }
}
