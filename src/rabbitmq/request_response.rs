// src/rabbitmq/request_response.rs
//
// Request/reply over two plain queues. Requests carry a fresh correlation id
// and `reply_to`; replies are matched back to the waiting caller by id only.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, OnceCell};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::client::MessagingClient;
use super::errors::{RabbitMQError, Result};
use super::events::Reporter;
use super::message::{Content, InboundMessage, PublishOptions};
use super::publisher::ErrorHandling;
use super::transport::QueueOptions;
use crate::config::RpcConfig;

type ReplySender = oneshot::Sender<Content<Value>>;
type PendingTable = Arc<Mutex<HashMap<String, ReplySender>>>;

/// Removes its table entry when the waiting caller goes away, whether the
/// reply arrived, the request timed out or the future was dropped.
struct PendingCall {
    correlation_id: String,
    table: PendingTable,
}

impl PendingCall {
    fn register(table: &PendingTable) -> (Self, oneshot::Receiver<Content<Value>>) {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = table.lock() {
            pending.insert(correlation_id.clone(), tx);
        }
        let call = Self {
            correlation_id,
            table: table.clone(),
        };
        (call, rx)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.table.lock() {
            pending.remove(&self.correlation_id);
        }
    }
}

pub struct RpcEngine {
    client: Arc<MessagingClient>,
    config: RpcConfig,
    pending: PendingTable,
    reply_consumer: OnceCell<String>,
    reporter: Reporter,
}

impl RpcEngine {
    pub fn new(client: Arc<MessagingClient>, config: RpcConfig) -> Self {
        let reporter = Reporter::new("rpc-client", client.sink());
        Self {
            client,
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            reply_consumer: OnceCell::new(),
            reporter,
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Declares both queues and starts consuming replies. Calling it again
    /// is a no-op.
    pub async fn init(&self) -> Result<()> {
        self.reply_consumer
            .get_or_try_init(|| async {
                self.client
                    .create_queue(&self.config.request_queue, QueueOptions::default())
                    .await?;
                self.client
                    .create_queue(
                        &self.config.reply_queue,
                        QueueOptions {
                            durable: true,
                            auto_delete: false,
                        },
                    )
                    .await?;

                let table = self.pending.clone();
                let reporter = self.reporter.clone();
                let tag = self
                    .client
                    .subscribe(&self.config.reply_queue, move |reply: InboundMessage<Value>| {
                        handle_reply(reply, table.clone(), reporter.clone())
                    })
                    .await?;

                info!(
                    requests = %self.config.request_queue,
                    replies = %self.config.reply_queue,
                    "RPC client ready"
                );
                Ok::<_, RabbitMQError>(tag)
            })
            .await
            .map(|_| ())
    }

    /// Sends `message` and waits for its reply. Uses the configured request
    /// timeout, if any.
    pub async fn request<M, R>(&self, message: &M) -> Result<R>
    where
        M: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call(message, self.config.request_timeout()).await
    }

    pub async fn request_with_timeout<M, R>(&self, message: &M, timeout: Duration) -> Result<R>
    where
        M: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call(message, Some(timeout)).await
    }

    async fn call<M, R>(&self, message: &M, timeout: Option<Duration>) -> Result<R>
    where
        M: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let (call, reply) = PendingCall::register(&self.pending);
        debug!(correlation_id = %call.correlation_id, "Sending RPC request");

        let options = PublishOptions::default()
            .with_correlation_id(call.correlation_id.clone())
            .with_reply_to(self.config.reply_queue.clone());
        self.client
            .publish(&self.config.request_queue, message, options, ErrorHandling::Propagate)
            .await?;
        self.reporter.log(
            "RPC request sent",
            json!({ "queue": self.config.request_queue, "correlationId": call.correlation_id }),
        );

        let content = match timeout {
            Some(limit) => tokio::time::timeout(limit, reply)
                .await
                .map_err(|_| RabbitMQError::TimeoutError(limit))?,
            None => reply.await,
        }
        .map_err(|_| RabbitMQError::ResponseChannelClosed)?;

        self.reporter
            .success("RPC reply received", json!({ "correlationId": call.correlation_id }));
        drop(call);
        content.into_typed()
    }

    /// Requests still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }
}

async fn handle_reply(reply: InboundMessage<Value>, table: PendingTable, reporter: Reporter) {
    // Replies are never redelivered, matched or not
    if let Err(e) = reply.ack().await {
        reporter.error("Failed to acknowledge reply", json!({ "error": e.to_string() }));
    }

    let correlation_id = reply.correlation_id.clone().unwrap_or_default();
    let waiting = table
        .lock()
        .ok()
        .and_then(|mut pending| pending.remove(&correlation_id));

    match waiting {
        Some(sender) => {
            // The caller may have given up in the meantime
            let _ = sender.send(reply.content);
        }
        None => {
            let err = RabbitMQError::UnmatchedReply(correlation_id.clone());
            reporter.error(err.to_string(), json!({ "correlationId": correlation_id }));
        }
    }
}

/// Answers requests from a request queue.
pub struct RpcServer {
    client: Arc<MessagingClient>,
    request_queue: String,
    reporter: Reporter,
}

impl RpcServer {
    pub fn new(client: Arc<MessagingClient>, request_queue: &str) -> Self {
        let reporter = Reporter::new("rpc-server", client.sink());
        Self {
            client,
            request_queue: request_queue.to_string(),
            reporter,
        }
    }

    /// Declares the request queue and starts handling requests. Each reply
    /// goes to the request's `reply_to` with its correlation id. Requests
    /// that cannot be answered are rejected without requeue. Returns the
    /// consumer tag.
    pub async fn serve<Req, Resp, F, Fut>(&self, handler: F) -> Result<String>
    where
        Req: DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + Send + Sync + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        self.client
            .create_queue(&self.request_queue, QueueOptions::default())
            .await?;

        let handler = Arc::new(handler);
        let client = self.client.clone();
        let reporter = self.reporter.clone();
        let tag = self
            .client
            .subscribe(&self.request_queue, move |request: InboundMessage<Req>| {
                process_request(request, handler.clone(), client.clone(), reporter.clone())
            })
            .await?;

        info!(queue = %self.request_queue, "RPC server started");
        Ok(tag)
    }

    pub async fn stop(&self, consumer_tag: &str) -> Result<()> {
        self.client.unsubscribe(&self.request_queue, consumer_tag).await
    }
}

async fn process_request<Req, Resp, F, Fut>(
    mut request: InboundMessage<Req>,
    handler: Arc<F>,
    client: Arc<MessagingClient>,
    reporter: Reporter,
) where
    Req: DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + Send + Sync + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
{
    let (reply_to, correlation_id) = match (request.reply_to.clone(), request.correlation_id.clone()) {
        (Some(reply_to), Some(correlation_id)) => (reply_to, correlation_id),
        _ => {
            reporter.error(
                "Rejected RPC request without reply_to or correlation_id",
                json!({ "routingKey": request.routing_key }),
            );
            reject(&request, &reporter).await;
            return;
        }
    };

    let body = match std::mem::replace(&mut request.content, Content::Raw(String::new())) {
        Content::Decoded(body) => body,
        Content::Raw(raw) => {
            reporter.error(
                "Rejected undecodable RPC request",
                json!({ "correlationId": correlation_id, "payload": raw }),
            );
            reject(&request, &reporter).await;
            return;
        }
    };

    let response = match handler(body).await {
        Ok(response) => response,
        Err(e) => {
            reporter.error(
                "RPC handler failed",
                json!({ "correlationId": correlation_id, "error": e.to_string() }),
            );
            reject(&request, &reporter).await;
            return;
        }
    };

    let options = PublishOptions::default().with_correlation_id(correlation_id.clone());
    match client.send(&reply_to, &response, options, ErrorHandling::Propagate).await {
        Ok(()) => {
            if let Err(e) = request.ack().await {
                error!(correlation_id = %correlation_id, error = %e, "Failed to acknowledge request");
            }
        }
        Err(e) => {
            reporter.error(
                "Failed to send RPC reply",
                json!({ "correlationId": correlation_id, "error": e.to_string() }),
            );
            // Let another attempt answer it
            if let Err(e) = request.nack(true).await {
                error!(correlation_id = %correlation_id, error = %e, "Failed to requeue request");
            }
        }
    }
}

async fn reject<T>(request: &InboundMessage<T>, reporter: &Reporter) {
    if let Err(e) = request.nack(false).await {
        reporter.error("Failed to reject request", json!({ "error": e.to_string() }));
    }
}
