// src/rabbitmq/transport/amqp.rs
//
// lapin-backed transport. A supervisor task owns the connection: it dials the
// configured hosts, attaches every registered channel (replaying its setup),
// re-attaches channels the broker closed, and starts over when the
// connection drops.

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{message::Delivery, BasicProperties, Channel, Connection};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, error, info, warn};

use super::{
    BrokerTransport, ChannelEvent, ChannelOps, ChannelSet, ChannelSpec, ConnectionEvent, DeliveryHandler,
    PublishOutcome, QueueInfo, QueueOptions, RawDelivery,
};
use crate::config::BrokerConfig;
use crate::rabbitmq::channel_manager::ManagedChannel;
use crate::rabbitmq::connection::{redact, ConnectionManager};
use crate::rabbitmq::errors::{RabbitMQError, Result};
use crate::rabbitmq::message::PublishOptions;

pub struct AmqpTransport {
    inner: Arc<AmqpInner>,
}

struct AmqpInner {
    connection: RwLock<Option<Arc<Connection>>>,
    channels: ChannelSet,
    events: broadcast::Sender<ConnectionEvent>,
    reconnect_time: Duration,
    closing: AtomicBool,
    shutdown: Notify,
    gave_up: RwLock<Option<String>>,
}

impl AmqpTransport {
    /// Starts the connection supervisor and returns immediately; channels
    /// created before the first connect attach once it succeeds.
    pub fn connect(config: &BrokerConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        let reconnect_time = config.reconnect_time();
        let inner = Arc::new(AmqpInner {
            connection: RwLock::new(None),
            channels: ChannelSet::default(),
            events,
            reconnect_time,
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
            gave_up: RwLock::new(None),
        });

        let manager = ConnectionManager::new(config.urls(), &config.connection_name)
            .with_reconnect_policy(config.opts.max_reconnect_attempts, reconnect_time);
        tokio::spawn(supervise(inner.clone(), manager));

        Self { inner }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current().map_or(false, |conn| conn.status().connected())
    }
}

impl AmqpInner {
    fn current(&self) -> Option<Arc<Connection>> {
        self.connection.read().ok().and_then(|guard| guard.clone())
    }

    fn set_current(&self, connection: Option<Arc<Connection>>) {
        if let Ok(mut guard) = self.connection.write() {
            *guard = connection;
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Set once the supervisor stopped dialing for good.
    fn gave_up(&self) -> Option<String> {
        self.gave_up.read().ok().and_then(|guard| guard.clone())
    }

    /// Rejects every channel still waiting for a connection.
    fn give_up(&self, reason: String) {
        if let Ok(mut guard) = self.gave_up.write() {
            *guard = Some(reason.clone());
        }
        for channel in self.channels.live() {
            channel.fail(&reason);
        }
        self.emit(ConnectionEvent::Disconnected { reason });
    }
}

async fn supervise(inner: Arc<AmqpInner>, mut manager: ConnectionManager) {
    while !inner.is_closing() {
        let (connection, url) = match manager.establish_connection().await {
            Ok(established) => established,
            Err(e) => {
                error!(error = %e, "Giving up on the broker connection");
                inner.give_up(e.to_string());
                return;
            }
        };

        let (lost_tx, mut lost_rx) = oneshot::channel::<String>();
        let mut lost_tx = Some(lost_tx);
        connection.on_error(move |err| {
            if let Some(tx) = lost_tx.take() {
                let _ = tx.send(err.to_string());
            }
        });

        let connection = Arc::new(connection);
        inner.set_current(Some(connection.clone()));
        inner.emit(ConnectionEvent::Connected { url: redact(&url) });

        for channel in inner.channels.live() {
            attach(&connection, &channel).await;
        }

        let reason = loop {
            tokio::select! {
                lost = &mut lost_rx => {
                    break lost.unwrap_or_else(|_| "connection dropped".to_string());
                }
                _ = inner.shutdown.notified() => {
                    break "closed by client".to_string();
                }
                _ = tokio::time::sleep(inner.reconnect_time) => {
                    if inner.is_closing() {
                        break "closed by client".to_string();
                    }
                    // Channels the broker closed (e.g. after a failed
                    // declaration) get a fresh raw channel and replay setup
                    for channel in inner.channels.live() {
                        if channel.needs_attach() && connection.status().connected() {
                            attach(&connection, &channel).await;
                        }
                    }
                }
            }
        };

        inner.set_current(None);
        warn!(reason = %reason, "Broker connection lost");
        for channel in inner.channels.live() {
            channel.detach(&reason);
        }
        inner.emit(ConnectionEvent::Disconnected { reason });

        if inner.is_closing() {
            break;
        }
        tokio::time::sleep(inner.reconnect_time).await;
    }
    debug!("Connection supervisor stopped");
}

async fn attach(connection: &Connection, channel: &Arc<ManagedChannel>) {
    let raw = match open_raw_channel(connection, channel).await {
        Ok(raw) => raw,
        Err(e) => {
            error!(channel = %channel.name(), error = %e, "Failed to create channel");
            channel.fail(&e.to_string());
            return;
        }
    };
    // Setup failures surface as channel events
    let _ = channel.attach(raw).await;
}

async fn open_raw_channel(connection: &Connection, owner: &Arc<ManagedChannel>) -> Result<Arc<dyn ChannelOps>> {
    let channel = connection.create_channel().await?;

    // Channel-level closes (e.g. 406 on a declaration) leave the connection
    // up; the sweep re-attaches afterwards
    let owner = Arc::downgrade(owner);
    channel.on_error(move |err| {
        if let Some(owner) = owner.upgrade() {
            owner.raw_closed(&err.to_string());
        }
    });

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e)))?;
    Ok(Arc::new(AmqpChannel { channel }))
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    fn create_channel(&self, spec: ChannelSpec) -> (Arc<ManagedChannel>, broadcast::Receiver<ChannelEvent>) {
        let (channel, events) = ManagedChannel::new(spec);
        self.inner.channels.register(&channel);

        if let Some(reason) = self.inner.gave_up() {
            channel.fail(&reason);
            return (channel, events);
        }
        // Otherwise the supervisor attaches it on the next connect
        if let Some(connection) = self.inner.current() {
            let pending = channel.clone();
            tokio::spawn(async move { attach(&connection, &pending).await });
        }
        (channel, events)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
        if let Some(connection) = self.inner.current() {
            info!("Closing RabbitMQ connection gracefully");
            connection.close(200, "Closing connection").await?;
        }
        Ok(())
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn to_field_table(headers: &HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

fn from_field_table(table: Option<&FieldTable>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(table) = table {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                other => format!("{:?}", other),
            };
            headers.insert(key.as_str().to_string(), value);
        }
    }
    headers
}

fn to_raw_delivery(delivery: Delivery) -> RawDelivery {
    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        routing_key: delivery.routing_key.as_str().to_string(),
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        reply_to: delivery.properties.reply_to().as_ref().map(|r| r.as_str().to_string()),
        headers: from_field_table(delivery.properties.headers().as_ref()),
        redelivered: delivery.redelivered,
        data: delivery.data,
    }
}

#[async_trait]
impl ChannelOps for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<QueueInfo> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::DeclarationError {
                queue: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(QueueInfo {
            consumer_count: queue.consumer_count(),
            message_count: queue.message_count(),
        })
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, handler: DeliveryHandler) -> Result<String> {
        let mut consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        let tag = consumer_tag.to_string();
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => handler(to_raw_delivery(delivery)),
                    Err(e) => {
                        warn!(queue = %queue, consumer = %tag, error = %e, "Consumer stream failed");
                        break;
                    }
                }
            }
            debug!(queue = %queue, consumer = %tag, "Consumer stream ended");
        });

        Ok(consumer_tag.to_string())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<PublishOutcome> {
        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);
        if let Some(correlation_id) = &options.correlation_id {
            properties = properties.with_correlation_id(correlation_id.clone().into());
        }
        if let Some(reply_to) = &options.reply_to {
            properties = properties.with_reply_to(reply_to.clone().into());
        }
        if !options.headers.is_empty() {
            properties = properties.with_headers(to_field_table(&options.headers));
        }

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                payload,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        match confirm.await.map_err(|e| RabbitMQError::PublishError(e.to_string()))? {
            Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => Ok(PublishOutcome::Returned),
            Confirmation::Nack(None) => Err(RabbitMQError::PublishError(format!(
                "broker rejected message for queue '{}'",
                queue
            ))),
            _ => Ok(PublishOutcome::Confirmed),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<RawDelivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack })
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;
        Ok(message.map(|message| to_raw_delivery(message.delivery)))
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "Closing channel").await?;
        }
        Ok(())
    }
}
