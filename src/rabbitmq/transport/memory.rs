// src/rabbitmq/transport/memory.rs
//
// Brokerless transport. Keeps queues, unacked deliveries and consumers in
// process and follows the broker rules the messaging layer relies on:
// per-channel prefetch, requeue on nack/close, returned messages for unknown
// queues, auto-delete after the last consumer leaves. Disconnects and
// reconnects can be triggered by hand.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    BrokerTransport, ChannelEvent, ChannelOps, ChannelSet, ChannelSpec, ConnectionEvent, DeliveryHandler,
    PublishOutcome, QueueInfo, QueueOptions, RawDelivery,
};
use crate::rabbitmq::channel_manager::ManagedChannel;
use crate::rabbitmq::errors::{RabbitMQError, Result};
use crate::rabbitmq::message::PublishOptions;

const MEMORY_URL: &str = "memory://localhost";

#[derive(Clone)]
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

struct MemoryBroker {
    state: Mutex<BrokerState>,
    channels: ChannelSet,
    connected: AtomicBool,
    refuse_channels: AtomicBool,
    connection_events: broadcast::Sender<ConnectionEvent>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemQueue>,
    channels: HashMap<u64, MemChannelState>,
    consumers: Vec<MemConsumer>,
    next_channel_id: u64,
}

struct MemQueue {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    had_consumers: bool,
}

#[derive(Clone)]
struct StoredMessage {
    routing_key: String,
    data: Vec<u8>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    headers: HashMap<String, String>,
    redelivered: bool,
}

impl StoredMessage {
    fn into_delivery(self, delivery_tag: u64) -> RawDelivery {
        RawDelivery {
            delivery_tag,
            routing_key: self.routing_key,
            data: self.data,
            correlation_id: self.correlation_id,
            reply_to: self.reply_to,
            headers: self.headers,
            redelivered: self.redelivered,
        }
    }
}

#[derive(Default)]
struct MemChannelState {
    open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

impl MemChannelState {
    fn has_capacity(&self) -> bool {
        self.open && (self.prefetch == 0 || self.unacked.len() < self.prefetch as usize)
    }

    fn next_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }
}

struct MemConsumer {
    tag: String,
    channel_id: u64,
    queue: String,
    handler: DeliveryHandler,
}

impl BrokerState {
    fn open_channel(&mut self) -> u64 {
        self.next_channel_id += 1;
        let id = self.next_channel_id;
        self.channels.insert(
            id,
            MemChannelState {
                open: true,
                ..MemChannelState::default()
            },
        );
        id
    }

    fn channel_mut(&mut self, id: u64) -> Result<&mut MemChannelState> {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.open => Ok(channel),
            _ => Err(RabbitMQError::ChannelError(format!("channel {} is closed", id))),
        }
    }

    fn consumer_count(&self, queue: &str) -> usize {
        self.consumers.iter().filter(|c| c.queue == queue).count()
    }

    fn requeue(&mut self, queue: &str, mut message: StoredMessage) {
        if let Some(q) = self.queues.get_mut(queue) {
            message.redelivered = true;
            q.ready.push_front(message);
        }
    }

    fn auto_delete(&mut self, queue: &str) {
        let unused = self.consumer_count(queue) == 0;
        let remove = self
            .queues
            .get(queue)
            .map_or(false, |q| q.options.auto_delete && q.had_consumers && unused);
        if remove {
            debug!(queue, "Auto-deleting queue");
            self.queues.remove(queue);
        }
    }

    fn close_channel(&mut self, id: u64) {
        let unacked = match self.channels.get_mut(&id) {
            Some(channel) if channel.open => {
                channel.open = false;
                std::mem::take(&mut channel.unacked)
            }
            _ => return,
        };

        // Redeliver in original order
        let mut unacked: Vec<_> = unacked.into_iter().collect();
        unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, (queue, message)) in unacked {
            self.requeue(&queue, message);
        }

        let mut orphaned = Vec::new();
        self.consumers.retain(|c| {
            if c.channel_id == id {
                orphaned.push(c.queue.clone());
                false
            } else {
                true
            }
        });
        for queue in orphaned {
            self.auto_delete(&queue);
        }
    }

    /// Hands ready messages to consumers with spare prefetch capacity,
    /// one per consumer per pass.
    fn next_deliveries(&mut self) -> Vec<(DeliveryHandler, RawDelivery)> {
        let mut deliveries = Vec::new();
        loop {
            let mut progressed = false;
            for consumer in &self.consumers {
                let Some(channel) = self.channels.get_mut(&consumer.channel_id) else {
                    continue;
                };
                if !channel.has_capacity() {
                    continue;
                }
                let Some(message) = self
                    .queues
                    .get_mut(&consumer.queue)
                    .and_then(|q| q.ready.pop_front())
                else {
                    continue;
                };
                let tag = channel.next_tag();
                channel.unacked.insert(tag, (consumer.queue.clone(), message.clone()));
                deliveries.push((consumer.handler.clone(), message.into_delivery(tag)));
                progressed = true;
            }
            if !progressed {
                return deliveries;
            }
        }
    }
}

impl MemoryBroker {
    fn state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        self.state
            .lock()
            .map_err(|_| RabbitMQError::ConnectionError("memory broker state poisoned".to_string()))
    }

    fn dispatch(&self) {
        let deliveries = match self.state() {
            Ok(mut state) => state.next_deliveries(),
            Err(_) => return,
        };
        for (handler, delivery) in deliveries {
            handler(delivery);
        }
    }

    fn close_all(&self) {
        if let Ok(mut state) = self.state() {
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            for id in ids {
                state.close_channel(id);
            }
        }
    }

    async fn attach(self: &Arc<Self>, channel: &Arc<ManagedChannel>) {
        if self.refuse_channels.load(Ordering::SeqCst) {
            channel.fail("channel refused by broker");
            return;
        }
        let id = match self.state() {
            Ok(mut state) => state.open_channel(),
            Err(e) => {
                channel.fail(&e.to_string());
                return;
            }
        };
        let raw: Arc<dyn ChannelOps> = Arc::new(MemChannel {
            id,
            broker: self.clone(),
            owner: Arc::downgrade(channel),
        });
        // Failures are reported through the channel's events
        let _ = channel.attach(raw).await;
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (connection_events, _) = broadcast::channel(16);
        Self {
            broker: Arc::new(MemoryBroker {
                state: Mutex::new(BrokerState::default()),
                channels: ChannelSet::default(),
                connected: AtomicBool::new(true),
                refuse_channels: AtomicBool::new(false),
                connection_events,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.broker.connected.load(Ordering::SeqCst)
    }

    /// Drops the connection: every raw channel closes, unacked deliveries
    /// go back to their queues and consumers disappear.
    pub fn disconnect(&self) {
        self.broker.connected.store(false, Ordering::SeqCst);
        self.broker.close_all();
        let _ = self.broker.connection_events.send(ConnectionEvent::Disconnected {
            reason: "connection lost".to_string(),
        });
        for channel in self.broker.channels.live() {
            channel.detach("connection lost");
        }
    }

    /// Restores the connection and re-attaches every channel, which replays
    /// their setup procedures.
    pub async fn reconnect(&self) {
        self.broker.connected.store(true, Ordering::SeqCst);
        let _ = self.broker.connection_events.send(ConnectionEvent::Connected {
            url: MEMORY_URL.to_string(),
        });
        for channel in self.broker.channels.live() {
            if channel.needs_attach() {
                self.broker.attach(&channel).await;
            }
        }
    }

    /// Like a broker restart: disconnects and loses non-durable queues.
    pub fn restart_broker(&self) {
        self.disconnect();
        if let Ok(mut state) = self.broker.state() {
            state.queues.retain(|_, q| q.options.durable);
        }
    }

    /// While set, new raw channels fail to open.
    pub fn refuse_channels(&self, refuse: bool) {
        self.broker.refuse_channels.store(refuse, Ordering::SeqCst);
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.broker.state().map_or(false, |s| s.queues.contains_key(queue))
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.broker.state().ok()?.queues.get(queue).map(|q| q.options)
    }

    /// Messages ready for delivery.
    pub fn message_count(&self, queue: &str) -> usize {
        self.broker
            .state()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.ready.len()))
            .unwrap_or(0)
    }

    /// Messages delivered but neither acked nor rejected.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.broker.state().map_or(0, |s| {
            s.channels
                .values()
                .flat_map(|c| c.unacked.values())
                .filter(|(q, _)| q == queue)
                .count()
        })
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.broker.state().map_or(0, |s| s.consumer_count(queue))
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    fn create_channel(&self, spec: ChannelSpec) -> (Arc<ManagedChannel>, broadcast::Receiver<ChannelEvent>) {
        let (channel, events) = ManagedChannel::new(spec);
        self.broker.channels.register(&channel);

        if self.is_connected() {
            let broker = self.broker.clone();
            let pending = channel.clone();
            tokio::spawn(async move { broker.attach(&pending).await });
        }
        (channel, events)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.broker.connection_events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.broker.connected.store(false, Ordering::SeqCst);
        self.broker.close_all();
        let _ = self.broker.connection_events.send(ConnectionEvent::Disconnected {
            reason: "closed by client".to_string(),
        });
        Ok(())
    }
}

struct MemChannel {
    id: u64,
    broker: Arc<MemoryBroker>,
    owner: Weak<ManagedChannel>,
}

impl MemChannel {
    /// Broker-side channel close with the connection still up. The owner
    /// gets a fresh raw channel right away.
    fn close_by_broker(&self, reason: &str) {
        if let Ok(mut state) = self.broker.state() {
            state.close_channel(self.id);
        }
        self.broker.dispatch();

        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        if owner.raw_closed(reason) && self.broker.connected.load(Ordering::SeqCst) {
            let broker = self.broker.clone();
            tokio::spawn(async move { broker.attach(&owner).await });
        }
    }
}

#[async_trait]
impl ChannelOps for MemChannel {
    fn is_open(&self) -> bool {
        self.broker.connected.load(Ordering::SeqCst)
            && self
                .broker
                .state()
                .map_or(false, |s| s.channels.get(&self.id).map_or(false, |c| c.open))
    }

    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<QueueInfo> {
        let reason = {
            let mut state = self.broker.state()?;
            state.channel_mut(self.id)?;

            let consumer_count = state.consumer_count(name) as u32;
            match state.queues.get(name) {
                Some(queue) if queue.options != options => format!(
                    "PRECONDITION_FAILED - inequivalent arguments: declared {:?}, existing {:?}",
                    options, queue.options
                ),
                Some(queue) => {
                    return Ok(QueueInfo {
                        consumer_count,
                        message_count: queue.ready.len() as u32,
                    })
                }
                None => {
                    state.queues.insert(
                        name.to_string(),
                        MemQueue {
                            options,
                            ready: VecDeque::new(),
                            had_consumers: false,
                        },
                    );
                    return Ok(QueueInfo {
                        consumer_count: 0,
                        message_count: 0,
                    });
                }
            }
        };

        // A real broker closes the channel on a failed declaration
        self.close_by_broker(&reason);
        Err(RabbitMQError::DeclarationError {
            queue: name.to_string(),
            reason,
        })
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.broker.state()?;
        state.channel_mut(self.id)?.prefetch = count;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, handler: DeliveryHandler) -> Result<String> {
        {
            let mut state = self.broker.state()?;
            state.channel_mut(self.id)?;

            let Some(q) = state.queues.get_mut(queue) else {
                return Err(RabbitMQError::ChannelError(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )));
            };
            q.had_consumers = true;

            if state
                .consumers
                .iter()
                .any(|c| c.channel_id == self.id && c.tag == consumer_tag)
            {
                return Err(RabbitMQError::ConsumeError(format!(
                    "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                    consumer_tag
                )));
            }

            state.consumers.push(MemConsumer {
                tag: consumer_tag.to_string(),
                channel_id: self.id,
                queue: queue.to_string(),
                handler,
            });
        }
        self.broker.dispatch();
        Ok(consumer_tag.to_string())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.state()?;
        state.channel_mut(self.id)?;

        let position = state
            .consumers
            .iter()
            .position(|c| c.channel_id == self.id && c.tag == consumer_tag);
        if let Some(position) = position {
            let consumer = state.consumers.remove(position);
            state.auto_delete(&consumer.queue);
        }
        Ok(())
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<PublishOutcome> {
        {
            let mut state = self.broker.state()?;
            state.channel_mut(self.id)?;

            let Some(q) = state.queues.get_mut(queue) else {
                return Ok(PublishOutcome::Returned);
            };
            q.ready.push_back(StoredMessage {
                routing_key: queue.to_string(),
                data: payload.to_vec(),
                correlation_id: options.correlation_id.clone(),
                reply_to: options.reply_to.clone(),
                headers: options.headers.clone(),
                redelivered: false,
            });
        }
        self.broker.dispatch();
        Ok(PublishOutcome::Confirmed)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        {
            let mut state = self.broker.state()?;
            let channel = state.channel_mut(self.id)?;
            if channel.unacked.remove(&delivery_tag).is_none() {
                return Err(RabbitMQError::AckError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )));
            }
        }
        self.broker.dispatch();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        {
            let mut state = self.broker.state()?;
            let channel = state.channel_mut(self.id)?;
            let Some((queue, message)) = channel.unacked.remove(&delivery_tag) else {
                return Err(RabbitMQError::AckError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )));
            };
            if requeue {
                state.requeue(&queue, message);
            }
        }
        self.broker.dispatch();
        Ok(())
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<RawDelivery>> {
        let mut state = self.broker.state()?;
        state.channel_mut(self.id)?;

        let Some(q) = state.queues.get_mut(queue) else {
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        };
        let Some(message) = q.ready.pop_front() else {
            return Ok(None);
        };

        let channel = state.channel_mut(self.id)?;
        let tag = channel.next_tag();
        if !no_ack {
            channel.unacked.insert(tag, (queue.to_string(), message.clone()));
        }
        Ok(Some(message.into_delivery(tag)))
    }

    async fn close(&self) -> Result<()> {
        self.broker.state()?.close_channel(self.id);
        self.broker.dispatch();
        Ok(())
    }
}
