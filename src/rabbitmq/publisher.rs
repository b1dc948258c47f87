// src/rabbitmq/publisher.rs

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use super::channel_manager::ManagedChannel;
use super::errors::Result;
use super::events::Reporter;
use super::message::PublishOptions;
use super::queue_manager::QueueManager;
use super::transport::PublishOutcome;

/// What a failed publish does to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorHandling {
    /// Report the failure as an error event and return `Ok`.
    #[default]
    Report,
    /// Return the failure to the caller.
    Propagate,
}

pub struct Publisher {
    queues: Arc<QueueManager>,
    reporter: Reporter,
}

impl Publisher {
    pub fn new(queues: Arc<QueueManager>) -> Self {
        let reporter = Reporter::new("publisher", queues.registry().sink());
        Self { queues, reporter }
    }

    /// Sends `message` on the channel of a queue created through the queue
    /// manager. Unknown queues fail whatever `handling` says.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        message: &T,
        options: PublishOptions,
        handling: ErrorHandling,
    ) -> Result<()> {
        let record = self.queues.queue(queue)?;
        let result = deliver(&record.channel, queue, message, &options).await;
        self.settle("Message published", queue, result, handling)
    }

    /// Sends `message` on the shared default channel. The queue does not have
    /// to be known to this process.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        message: &T,
        options: PublishOptions,
        handling: ErrorHandling,
    ) -> Result<()> {
        let result = match self.queues.registry().default_channel().await {
            Ok(channel) => deliver(&channel, queue, message, &options).await,
            Err(e) => Err(e),
        };
        self.settle("Message sent", queue, result, handling)
    }

    fn settle(
        &self,
        done: &str,
        queue: &str,
        result: Result<PublishOutcome>,
        handling: ErrorHandling,
    ) -> Result<()> {
        match result {
            Ok(PublishOutcome::Confirmed) => {
                self.reporter.log(done, json!({ "queue": queue }));
                Ok(())
            }
            // Reported through the channel's events; not retried
            Ok(PublishOutcome::Returned) => Ok(()),
            Err(e) => {
                self.reporter
                    .error("Publish failed", json!({ "queue": queue, "error": e.to_string() }));
                match handling {
                    ErrorHandling::Report => Ok(()),
                    ErrorHandling::Propagate => Err(e),
                }
            }
        }
    }
}

async fn deliver<T: Serialize + ?Sized>(
    channel: &ManagedChannel,
    queue: &str,
    message: &T,
    options: &PublishOptions,
) -> Result<PublishOutcome> {
    let payload = serde_json::to_vec(message)?;
    let outcome = channel.send_to_queue(queue, &payload, options).await?;
    debug!(queue, bytes = payload.len(), ?outcome, "Publish settled");
    Ok(outcome)
}
