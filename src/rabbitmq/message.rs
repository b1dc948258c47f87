// src/rabbitmq/message.rs

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::errors::{RabbitMQError, Result};
use super::transport::{ChannelOps, RawDelivery};

/// Metadata attached to an outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: HashMap<String, String>,
}

impl PublishOptions {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Payload of a delivery: the decoded value, or the raw text when the bytes
/// are not valid JSON for `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum Content<T> {
    Decoded(T),
    Raw(String),
}

impl<T: DeserializeOwned> Content<T> {
    /// Never fails; undecodable payloads fall back to `Raw`.
    pub fn decode(data: &[u8]) -> Self {
        match serde_json::from_slice(data) {
            Ok(value) => Content::Decoded(value),
            Err(_) => Content::Raw(String::from_utf8_lossy(data).into_owned()),
        }
    }
}

impl<T> Content<T> {
    pub fn decoded(&self) -> Option<&T> {
        match self {
            Content::Decoded(value) => Some(value),
            Content::Raw(_) => None,
        }
    }

    pub fn into_decoded(self) -> Option<T> {
        match self {
            Content::Decoded(value) => Some(value),
            Content::Raw(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Content::Raw(_))
    }
}

impl Content<Value> {
    /// Converts a JSON payload into `R`. A raw payload is offered to `R` as a
    /// JSON string, so `R = String` always succeeds.
    pub fn into_typed<R: DeserializeOwned>(self) -> Result<R> {
        let value = match self {
            Content::Decoded(value) => value,
            Content::Raw(text) => Value::String(text),
        };
        serde_json::from_value(value).map_err(|e| RabbitMQError::DeserializationError(e.to_string()))
    }
}

/// One delivery handed to a subscriber callback.
pub struct InboundMessage<T> {
    pub content: Content<T>,
    pub reply_to: Option<String>,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub headers: HashMap<String, String>,
    pub redelivered: bool,
    delivery_tag: u64,
    channel: Arc<dyn ChannelOps>,
    settled: AtomicBool,
}

impl<T: DeserializeOwned> InboundMessage<T> {
    pub(crate) fn from_delivery(delivery: RawDelivery, channel: Arc<dyn ChannelOps>) -> Self {
        Self {
            content: Content::decode(&delivery.data),
            reply_to: delivery.reply_to,
            routing_key: delivery.routing_key,
            correlation_id: delivery.correlation_id,
            headers: delivery.headers,
            redelivered: delivery.redelivered,
            delivery_tag: delivery.delivery_tag,
            channel,
            settled: AtomicBool::new(false),
        }
    }

    /// A delivery fetched with no-ack; `ack`/`nack` become no-ops.
    pub(crate) fn pre_acknowledged(delivery: RawDelivery, channel: Arc<dyn ChannelOps>) -> Self {
        let message = Self::from_delivery(delivery, channel);
        message.settled.store(true, Ordering::SeqCst);
        message
    }
}

impl<T> InboundMessage<T> {
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub async fn ack(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel.ack(self.delivery_tag).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel.nack(self.delivery_tag, requeue).await
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for InboundMessage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("content", &self.content)
            .field("routing_key", &self.routing_key)
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("delivery_tag", &self.delivery_tag)
            .finish()
    }
}
