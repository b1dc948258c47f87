// src/rabbitmq/queue_manager.rs

use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::debug;

use super::channel_manager::ManagedChannel;
use super::errors::{RabbitMQError, Result};
use super::events::Reporter;
use super::registry::ChannelRegistry;
use super::transport::{setup_fn, QueueOptions, SetupFn};

/// A declared queue and the channel dedicated to it.
#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub name: String,
    pub channel: Arc<ManagedChannel>,
    pub options: QueueOptions,
}

pub struct QueueManager {
    registry: Arc<ChannelRegistry>,
    queues: RwLock<HashMap<String, QueueRecord>>,
    declaring: Mutex<()>,
    reporter: Reporter,
}

/// Prefetch 1, then assert the queue. Safe to run on every reconnect.
fn declare_queue(name: &str, options: QueueOptions) -> SetupFn {
    let name = name.to_string();
    setup_fn(move |channel| {
        let name = name.clone();
        async move {
            channel.prefetch(1).await?;
            let info = channel.assert_queue(&name, options).await?;
            debug!(
                queue = %name,
                consumers = info.consumer_count,
                messages = info.message_count,
                "Queue asserted"
            );
            Ok(())
        }
    })
}

fn as_declaration_error(queue: &str, error: RabbitMQError) -> RabbitMQError {
    match error {
        RabbitMQError::DeclarationError { .. } => error,
        other => RabbitMQError::DeclarationError {
            queue: queue.to_string(),
            reason: other.to_string(),
        },
    }
}

impl QueueManager {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        let reporter = Reporter::new("queue-manager", registry.sink());
        Self {
            registry,
            queues: RwLock::new(HashMap::new()),
            declaring: Mutex::new(()),
            reporter,
        }
    }

    pub fn registry(&self) -> Arc<ChannelRegistry> {
        self.registry.clone()
    }

    /// Declares `name` on its own channel. The declaration is re-run every
    /// time the channel reconnects. Declaring an existing name reuses its
    /// channel and asserts the queue once more, so option conflicts still
    /// surface.
    pub async fn create_queue(&self, name: &str, options: QueueOptions) -> Result<QueueRecord> {
        let _guard = self.declaring.lock().await;

        if let Ok(existing) = self.queue(name) {
            return self.reassert(existing, options).await;
        }

        self.reporter.log(
            "Creating queue",
            json!({ "queue": name, "durable": options.durable, "autoDelete": options.auto_delete }),
        );

        let channel = match self
            .registry
            .open_channel(name, Some(declare_queue(name, options)))
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                let e = as_declaration_error(name, e);
                self.reporter
                    .error("Queue creation failed", json!({ "queue": name, "error": e.to_string() }));
                return Err(e);
            }
        };

        let record = QueueRecord {
            name: name.to_string(),
            channel,
            options,
        };
        if let Ok(mut queues) = self.queues.write() {
            queues.insert(name.to_string(), record.clone());
        }

        self.reporter.success("Queue created", json!({ "queue": name }));
        Ok(record)
    }

    async fn reassert(&self, existing: QueueRecord, options: QueueOptions) -> Result<QueueRecord> {
        let result = match existing.channel.raw() {
            Ok(raw) => raw.assert_queue(&existing.name, options).await.map(|_| ()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.reporter.log("Queue already created", json!({ "queue": existing.name }));
                Ok(existing)
            }
            Err(e) => {
                let e = as_declaration_error(&existing.name, e);
                self.reporter.error(
                    "Queue creation failed",
                    json!({ "queue": existing.name, "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    pub fn queue(&self, name: &str) -> Result<QueueRecord> {
        self.queues
            .read()
            .ok()
            .and_then(|queues| queues.get(name).cloned())
            .ok_or_else(|| RabbitMQError::UnknownQueue(name.to_string()))
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .read()
            .map(|queues| queues.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
