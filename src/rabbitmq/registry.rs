// src/rabbitmq/registry.rs

use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, Mutex, OnceCell};
use tracing::{debug, warn};

use super::channel_manager::ManagedChannel;
use super::errors::Result;
use super::events::{EventSink, Reporter};
use super::transport::{BrokerTransport, ChannelEvent, ChannelSpec, ConnectionEvent, SetupFn};

pub const DEFAULT_CHANNEL: &str = "default";

/// Logical name → managed channel. Owns the transport for its lifetime.
pub struct ChannelRegistry {
    transport: Arc<dyn BrokerTransport>,
    reporter: Reporter,
    channels: RwLock<HashMap<String, Arc<ManagedChannel>>>,
    opening: Mutex<()>,
    default_channel: OnceCell<Arc<ManagedChannel>>,
}

impl ChannelRegistry {
    /// Must be called inside a tokio runtime; connection events are
    /// forwarded to `sink` from a background task.
    pub fn new(transport: Arc<dyn BrokerTransport>, sink: Arc<dyn EventSink>) -> Self {
        let reporter = Reporter::new("channel-registry", sink);
        tokio::spawn(forward_connection_events(
            transport.connection_events(),
            reporter.clone(),
        ));

        Self {
            transport,
            reporter,
            channels: RwLock::new(HashMap::new()),
            opening: Mutex::new(()),
            default_channel: OnceCell::new(),
        }
    }

    pub fn transport(&self) -> Arc<dyn BrokerTransport> {
        self.transport.clone()
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.reporter.sink()
    }

    /// Opens the channel `name`, or returns it if it is already open. Fails
    /// when the channel errors or closes before its first successful open;
    /// after that, failures only show up as events.
    pub async fn open_channel(&self, name: &str, setup: Option<SetupFn>) -> Result<Arc<ManagedChannel>> {
        let _guard = self.opening.lock().await;

        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }

        let channel = self.open_unregistered(name, setup).await?;
        if let Ok(mut channels) = self.channels.write() {
            channels.insert(name.to_string(), channel.clone());
        }
        Ok(channel)
    }

    async fn open_unregistered(&self, name: &str, setup: Option<SetupFn>) -> Result<Arc<ManagedChannel>> {
        let mut spec = ChannelSpec::new(name);
        if let Some(setup) = setup {
            spec = spec.with_setup(setup);
        }

        let (channel, events) = self.transport.create_channel(spec);
        tokio::spawn(forward_channel_events(
            name.to_string(),
            events,
            self.reporter.clone(),
        ));

        if let Err(e) = channel.wait_first_open().await {
            warn!(channel = name, error = %e, "Channel failed before first open");
            // The transport must not keep re-attaching an abandoned channel
            let _ = channel.close().await;
            return Err(e);
        }
        Ok(channel)
    }

    /// The shared channel used for `send` and `get_message`.
    pub async fn default_channel(&self) -> Result<Arc<ManagedChannel>> {
        self.default_channel
            .get_or_try_init(|| self.open_unregistered(DEFAULT_CHANNEL, None))
            .await
            .cloned()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ManagedChannel>> {
        self.channels.read().ok()?.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .read()
            .map(|channels| channels.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Closes every channel, then the transport.
    pub async fn close(&self) -> Result<()> {
        let channels: Vec<Arc<ManagedChannel>> = self
            .channels
            .write()
            .map(|mut channels| channels.drain().map(|(_, c)| c).collect())
            .unwrap_or_default();

        for channel in channels.iter().chain(self.default_channel.get()) {
            if let Err(e) = channel.close().await {
                debug!(channel = channel.name(), error = %e, "Ignoring close failure");
            }
        }
        self.transport.close().await
    }
}

async fn forward_channel_events(
    name: String,
    mut events: broadcast::Receiver<ChannelEvent>,
    reporter: Reporter,
) {
    loop {
        match events.recv().await {
            Ok(ChannelEvent::Opened) => reporter.log("Channel opened", json!({ "channel": name })),
            Ok(ChannelEvent::Closed { reason }) => {
                reporter.log("Channel closed", json!({ "channel": name, "reason": reason }))
            }
            Ok(ChannelEvent::Errored { reason }) => {
                reporter.error("Channel error", json!({ "channel": name, "reason": reason }))
            }
            Ok(ChannelEvent::MessageDropped { queue }) => reporter.error(
                "Message dropped by broker",
                json!({ "channel": name, "queue": queue }),
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(channel = %name, skipped, "Channel events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn forward_connection_events(mut events: broadcast::Receiver<ConnectionEvent>, reporter: Reporter) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Connected { url }) => {
                reporter.success("Connected to broker", json!({ "url": url }))
            }
            Ok(ConnectionEvent::Disconnected { reason }) => {
                reporter.error("Disconnected from broker", json!({ "reason": reason }))
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
