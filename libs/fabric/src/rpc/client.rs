use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use courier_core::{Delivery, MessageProperties, QueueOptions};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};

use crate::codec::{Codec, JsonCodec};
use crate::endpoint::{Endpoint, QueueBinding};
use crate::error::{CancelReason, Error, Result};
use crate::params::{configured, RpcParams};
use crate::transport::{Broker, Channel, ConsumerEvent};
use crate::wire::{decode_result, encode_command, CommandResult};

/// Sends commands to an RPC server and matches replies to callers
///
/// Lifecycle is `created -> started -> stopped`; a stopped client cannot be
/// started again. Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    endpoint: Endpoint,
    requests_queue: String,
    replies_queue: Option<String>,
    timeout: Duration,
    default_options: MessageProperties,
    lifecycle: Mutex<Lifecycle>,
    replies: Mutex<Option<QueueBinding>>,
    consumer_tag: Mutex<Option<String>>,
    reply_task: Mutex<Option<JoinHandle<()>>>,
    next_correlation_id: AtomicU64,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Stopped,
}

/// A command waiting for its reply
struct PendingRequest {
    command: String,
    timer: AbortHandle,
    reply: oneshot::Sender<Result<Value>>,
}

impl RpcClient {
    /// Create a client; `params.requests_queue` is required
    pub fn new(broker: Arc<dyn Broker>, params: RpcParams) -> Result<Self> {
        let requests_queue = configured(&params.requests_queue)
            .ok_or_else(|| Error::Configuration("params.requestsQueue is required".to_string()))?
            .to_string();

        Ok(Self {
            inner: Arc::new(ClientInner {
                endpoint: Endpoint::new(broker),
                requests_queue,
                replies_queue: configured(&params.replies_queue).map(str::to_string),
                timeout: params.timeout,
                default_options: params.default_message_options,
                lifecycle: Mutex::new(Lifecycle::Created),
                replies: Mutex::new(None),
                consumer_tag: Mutex::new(None),
                reply_task: Mutex::new(None),
                next_correlation_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Create a builder for configuring the client
    pub fn builder() -> RpcClientBuilder {
        RpcClientBuilder::new()
    }

    /// Acquire a channel, declare the reply queue and start consuming it
    pub async fn start(&self) -> Result<()> {
        match *self.inner.lifecycle.lock() {
            Lifecycle::Started => return Ok(()),
            Lifecycle::Stopped => return Err(Error::Stopped),
            Lifecycle::Created => {}
        }

        if let Err(e) = self.open_replies().await {
            let _ = self.inner.endpoint.disconnect().await;
            return Err(e);
        }

        *self.inner.lifecycle.lock() = Lifecycle::Started;
        Ok(())
    }

    async fn open_replies(&self) -> Result<()> {
        let channel = self.inner.endpoint.start().await?;

        let requests_queue = &self.inner.requests_queue;
        let binding = QueueBinding::resolve(self.inner.replies_queue.as_deref(), || {
            format!("{requests_queue}.{}", uuid::Uuid::new_v4())
        });

        channel
            .assert_queue(binding.name(), QueueOptions::exclusive(true))
            .await?;
        let mut consumer = channel.consume(binding.name()).await?;
        tracing::debug!(replies_queue = %binding.name(), consumer_tag = %consumer.tag, "rpc client started");

        *self.inner.consumer_tag.lock() = Some(consumer.tag.clone());
        *self.inner.replies.lock() = Some(binding);

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(event) = consumer.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match event {
                    ConsumerEvent::Delivery(delivery) => {
                        inner.dispatch_reply(channel.as_ref(), delivery).await
                    }
                    ConsumerEvent::Cancelled => {
                        tracing::debug!("replies consumer cancelled by broker");
                        break;
                    }
                }
            }
        });
        *self.inner.reply_task.lock() = Some(task);
        Ok(())
    }

    /// Publish a command and return the handle its outcome arrives on
    ///
    /// Message properties are `options`, overridden by the client's default
    /// options, overridden by `replyTo` and `correlationId`.
    pub async fn send_command(
        &self,
        command: &str,
        args: Vec<Value>,
        options: MessageProperties,
    ) -> Result<ReplyHandle> {
        let channel = self.inner.endpoint.require_channel()?;
        let reply_to = self.replies_queue().ok_or(Error::NotStarted)?;

        let correlation_id = self
            .inner
            .next_correlation_id
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        let properties = MessageProperties::new()
            .content_type(JsonCodec::CONTENT_TYPE)
            .overlay(&options)
            .overlay(&self.inner.default_options)
            .overlay(
                &MessageProperties::new()
                    .reply_to(reply_to)
                    .correlation_id(correlation_id.clone()),
            );
        let payload = encode_command(command, &args)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            let timer = self.arm_timer(correlation_id.clone());
            pending.insert(
                correlation_id.clone(),
                PendingRequest {
                    command: command.to_string(),
                    timer,
                    reply: tx,
                },
            );
        }

        tracing::debug!(%command, %correlation_id, requests_queue = %self.inner.requests_queue, "sending command");
        if let Err(e) = channel
            .send_to_queue(&self.inner.requests_queue, payload, properties)
            .await
        {
            if let Some(request) = self.inner.pending.lock().remove(&correlation_id) {
                request.timer.abort();
            }
            return Err(e.into());
        }

        Ok(ReplyHandle {
            correlation_id,
            command: command.to_string(),
            reply: rx,
        })
    }

    /// Send a command with no extra options and wait for its outcome
    pub async fn call(&self, command: &str, args: Vec<Value>) -> Result<Value> {
        self.send_command(command, args, MessageProperties::default())
            .await?
            .await
    }

    fn arm_timer(&self, correlation_id: String) -> AbortHandle {
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.cancel(&correlation_id, CancelReason::Timeout(timeout));
            }
        })
        .abort_handle()
    }

    /// Cancel the reply consumer, drop a generated reply queue, reject every
    /// pending command and release the channel
    ///
    /// Teardown continues past broker failures; the first one is returned.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle != Lifecycle::Started {
                return Ok(());
            }
            *lifecycle = Lifecycle::Stopped;
        }

        let mut first_error: Option<Error> = None;

        if let Some(channel) = self.inner.endpoint.channel() {
            let tag = self.inner.consumer_tag.lock().take();
            if let Some(tag) = tag {
                if let Err(e) = channel.cancel(&tag).await {
                    first_error.get_or_insert(e.into());
                }
            }

            let owned = match self.inner.replies.lock().as_ref() {
                Some(QueueBinding::Owned(name)) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = owned {
                if let Err(e) = channel.delete_queue(&name).await {
                    first_error.get_or_insert(e.into());
                }
                *self.inner.replies.lock() = None;
            }
        }

        let ids: Vec<String> = self.inner.pending.lock().keys().cloned().collect();
        for correlation_id in ids {
            self.inner
                .cancel(&correlation_id, CancelReason::ClientDisconnect);
        }

        if let Err(e) = self.inner.endpoint.disconnect().await {
            first_error.get_or_insert(e);
        }
        if let Some(task) = self.inner.reply_task.lock().take() {
            task.abort();
        }
        tracing::debug!("rpc client disconnected");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The reply queue in use, generated at start when not configured
    pub fn replies_queue(&self) -> Option<String> {
        self.inner
            .replies
            .lock()
            .as_ref()
            .map(|binding| binding.name().to_string())
    }

    pub fn requests_queue(&self) -> &str {
        &self.inner.requests_queue
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Commands sent and not yet replied to, timed out or cancelled
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl ClientInner {
    async fn dispatch_reply(&self, channel: &dyn Channel, delivery: Delivery) {
        if let Err(e) = channel.ack(&delivery).await {
            tracing::warn!(error = %e, "failed to ack reply");
        }

        let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
            tracing::debug!("reply without correlation id dropped");
            return;
        };

        // Late replies (after a timeout) and unknown ids are dropped
        let Some(request) = self.pending.lock().remove(correlation_id) else {
            tracing::debug!(%correlation_id, "reply for unknown correlation id dropped");
            return;
        };
        request.timer.abort();

        let outcome = decode_result(&delivery.payload).and_then(CommandResult::into_result);
        tracing::debug!(command = %request.command, %correlation_id, ok = outcome.is_ok(), "reply received");
        let _ = request.reply.send(outcome);
    }

    /// Remove and reject a pending command; false when it already completed
    fn cancel(&self, correlation_id: &str, reason: CancelReason) -> bool {
        let Some(request) = self.pending.lock().remove(correlation_id) else {
            return false;
        };
        request.timer.abort();

        tracing::debug!(command = %request.command, %correlation_id, %reason, "command cancelled");
        let _ = request.reply.send(Err(Error::Cancelled {
            reason,
            command: request.command,
            correlation_id: correlation_id.to_string(),
        }));
        true
    }
}

/// Deferred outcome of a sent command
///
/// Resolves exactly once: with the reply payload, the remote error, or a
/// cancellation.
#[derive(Debug)]
#[must_use = "a reply handle does nothing unless awaited"]
pub struct ReplyHandle {
    correlation_id: String,
    command: String,
    reply: oneshot::Receiver<Result<Value>>,
}

impl ReplyHandle {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Future for ReplyHandle {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.reply).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::custom(format!(
                "client dropped before command {} (correlationId:{}) completed",
                self.command, self.correlation_id
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Builder for configuring an RPC client
#[derive(Default)]
pub struct RpcClientBuilder {
    params: RpcParams,
}

impl RpcClientBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue commands are sent to
    pub fn requests_queue(mut self, queue: impl Into<String>) -> Self {
        self.params.requests_queue = Some(queue.into());
        self
    }

    /// Set a fixed reply queue instead of a generated one
    pub fn replies_queue(mut self, queue: impl Into<String>) -> Self {
        self.params.replies_queue = Some(queue.into());
        self
    }

    /// Set the per-command timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.params.timeout = timeout;
        self
    }

    /// Set properties applied to every command
    pub fn default_message_options(mut self, options: MessageProperties) -> Self {
        self.params.default_message_options = options;
        self
    }

    /// Build the client
    pub fn build(self, broker: Arc<dyn Broker>) -> Result<RpcClient> {
        RpcClient::new(broker, self.params)
    }
}
