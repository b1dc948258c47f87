// src/rabbitmq/channel_manager.rs

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use super::errors::{RabbitMQError, Result};
use super::message::PublishOptions;
use super::transport::{ChannelEvent, ChannelOps, ChannelSpec, PublishOutcome, RawDelivery, SetupFn};

const EVENT_BUFFER: usize = 64;

pub type SetupId = u64;

type FirstOpen = Option<std::result::Result<(), String>>;

/// A reconnect-stable channel. The transport swaps the raw channel underneath
/// it and replays every registered setup procedure on each attach.
pub struct ManagedChannel {
    name: String,
    json: bool,
    setups: Mutex<Vec<(SetupId, SetupFn)>>,
    next_setup_id: AtomicU64,
    current: RwLock<Option<Arc<dyn ChannelOps>>>,
    events: broadcast::Sender<ChannelEvent>,
    first_open: watch::Sender<FirstOpen>,
    closed: AtomicBool,
}

impl ManagedChannel {
    pub(crate) fn new(spec: ChannelSpec) -> (Arc<Self>, broadcast::Receiver<ChannelEvent>) {
        let (events, receiver) = broadcast::channel(EVENT_BUFFER);
        let (first_open, _) = watch::channel(None);

        let setups = spec.setup.into_iter().map(|setup| (0, setup)).collect();

        debug!(channel = %spec.name, json = spec.json, "Creating managed channel");

        let channel = Arc::new(Self {
            name: spec.name,
            json: spec.json,
            setups: Mutex::new(setups),
            next_setup_id: AtomicU64::new(1),
            current: RwLock::new(None),
            events,
            first_open,
            closed: AtomicBool::new(false),
        });
        (channel, receiver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.current().map_or(false, |raw| raw.is_open())
    }

    /// True when the transport should attach a fresh raw channel.
    pub(crate) fn needs_attach(&self) -> bool {
        !self.is_closed() && !self.is_connected()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn current(&self) -> Option<Arc<dyn ChannelOps>> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }

    /// The live raw channel.
    pub fn raw(&self) -> Result<Arc<dyn ChannelOps>> {
        match self.current() {
            Some(raw) if raw.is_open() => Ok(raw),
            _ => Err(RabbitMQError::ChannelError(format!(
                "channel '{}' is not connected",
                self.name
            ))),
        }
    }

    /// Resolves with the outcome of the first attach attempt.
    pub async fn wait_first_open(&self) -> Result<()> {
        let mut receiver = self.first_open.subscribe();
        let outcome = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RabbitMQError::ChannelError(format!("channel '{}' dropped", self.name)))?
            .clone();

        outcome.unwrap_or(Ok(())).map_err(RabbitMQError::ChannelError)
    }

    fn settle_first_open(&self, outcome: std::result::Result<(), String>) {
        self.first_open.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(outcome);
                true
            } else {
                false
            }
        });
    }

    fn emit(&self, event: ChannelEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Registers a setup procedure; runs it right away when connected. A
    /// procedure that fails on the live channel is not registered.
    pub async fn add_setup(&self, setup: SetupFn) -> Result<SetupId> {
        let mut setups = self.setups.lock().await;
        if let Some(raw) = self.current().filter(|raw| raw.is_open()) {
            setup(raw).await?;
        }
        let id = self.next_setup_id.fetch_add(1, Ordering::SeqCst);
        setups.push((id, setup));
        Ok(id)
    }

    pub async fn remove_setup(&self, id: SetupId) -> bool {
        let mut setups = self.setups.lock().await;
        let before = setups.len();
        setups.retain(|(setup_id, _)| *setup_id != id);
        setups.len() != before
    }

    pub async fn setup_count(&self) -> usize {
        self.setups.lock().await.len()
    }

    /// Installs a fresh raw channel and replays every setup procedure on it.
    pub(crate) async fn attach(&self, raw: Arc<dyn ChannelOps>) -> Result<()> {
        let setups = self.setups.lock().await;

        if let Some(previous) = self.current.write().ok().and_then(|mut guard| guard.take()) {
            if previous.is_open() {
                let _ = previous.close().await;
            }
        }

        for (_, setup) in setups.iter() {
            if let Err(e) = setup(raw.clone()).await {
                warn!(channel = %self.name, error = %e, "Channel setup failed");
                let _ = raw.close().await;
                self.emit(ChannelEvent::Errored {
                    reason: e.to_string(),
                });
                self.settle_first_open(Err(e.to_string()));
                return Err(e);
            }
        }

        if let Ok(mut guard) = self.current.write() {
            *guard = Some(raw);
        }

        info!(channel = %self.name, setups = setups.len(), "Channel attached");
        self.emit(ChannelEvent::Opened);
        self.settle_first_open(Ok(()));
        Ok(())
    }

    /// Called by the transport when the raw channel is gone.
    pub(crate) fn detach(&self, reason: &str) {
        let had_channel = self
            .current
            .write()
            .ok()
            .and_then(|mut guard| guard.take())
            .is_some();

        if had_channel {
            debug!(channel = %self.name, reason, "Channel detached");
            self.emit(ChannelEvent::Closed {
                reason: reason.to_string(),
            });
        }
        self.settle_first_open(Err(reason.to_string()));
    }

    /// Called when the broker closed a raw channel while the connection stayed
    /// up. Only detaches if the installed raw channel is the one that died;
    /// returns whether it did.
    pub(crate) fn raw_closed(&self, reason: &str) -> bool {
        let dead = self.current().map_or(false, |raw| !raw.is_open());
        if dead {
            warn!(channel = %self.name, reason, "Channel closed by broker");
            self.detach(reason);
        }
        dead
    }

    /// Called by the transport when a raw channel could not be opened.
    pub(crate) fn fail(&self, reason: &str) {
        self.emit(ChannelEvent::Errored {
            reason: reason.to_string(),
        });
        self.settle_first_open(Err(reason.to_string()));
    }

    pub async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<PublishOutcome> {
        let outcome = self.raw()?.send_to_queue(queue, payload, options).await?;
        if outcome == PublishOutcome::Returned {
            self.emit(ChannelEvent::MessageDropped {
                queue: queue.to_string(),
            });
        }
        Ok(outcome)
    }

    pub async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<(RawDelivery, Arc<dyn ChannelOps>)>> {
        let raw = self.raw()?;
        Ok(raw.get(queue, no_ack).await?.map(|delivery| (delivery, raw)))
    }

    pub async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.raw()?.cancel(consumer_tag).await
    }

    /// Closes the channel for good; transports stop re-attaching it.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let raw = self.current.write().ok().and_then(|mut guard| guard.take());
        if let Some(raw) = raw {
            raw.close().await?;
            self.emit(ChannelEvent::Closed {
                reason: "closed by client".to_string(),
            });
        }
        self.settle_first_open(Err(format!("channel '{}' closed", self.name)));
        Ok(())
    }
}

impl std::fmt::Debug for ManagedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedChannel")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}
