use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use courier_core::{Delivery, DeliveryMode, MessageProperties, QueueOptions};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::codec::{Codec, JsonCodec};
use crate::endpoint::{Endpoint, QueueBinding};
use crate::error::{Error, RemoteError, Result};
use crate::params::{configured, RpcParams};
use crate::transport::{Broker, Channel, ConsumerEvent};
use crate::wire::{decode_command, CommandResult};

/// Error type command handlers may fail with
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by a registered command handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, BoxError>> + Send>>;

type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Serves registered commands from a requests queue
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    endpoint: Endpoint,
    configured_queue: Option<String>,
    commands: RwLock<HashMap<String, Handler>>,
    requests: Mutex<Option<QueueBinding>>,
    consumer_tag: Mutex<Option<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Create a server; an unset `params.requests_queue` means a
    /// broker-generated queue owned by the server
    pub fn new(broker: Arc<dyn Broker>, params: RpcParams) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                endpoint: Endpoint::new(broker),
                configured_queue: configured(&params.requests_queue).map(str::to_string),
                commands: RwLock::new(HashMap::new()),
                requests: Mutex::new(None),
                consumer_tag: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    /// Create a builder for configuring the server
    pub fn builder() -> RpcServerBuilder {
        RpcServerBuilder::new()
    }

    /// Register a handler for `command`, replacing any previous one
    ///
    /// The handler receives the command's positional arguments. Its value is
    /// serialized into a success result; its error into an error result.
    pub fn add_command<F, Fut, T, E>(&self, command: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Serialize,
        E: Into<BoxError>,
    {
        let boxed: Handler = Arc::new(move |args: Vec<Value>| -> HandlerFuture {
            let call = handler(args);
            Box::pin(async move {
                let value = call.await.map_err(Into::<BoxError>::into)?;
                let value = serde_json::to_value(value)
                    .map_err(|e| Box::new(Error::Codec(e.to_string())) as BoxError)?;
                Ok::<Value, BoxError>(value)
            })
        });
        self.inner.commands.write().insert(command.into(), boxed);
        self
    }

    /// Whether a handler is registered for `command`
    pub fn has_command(&self, command: &str) -> bool {
        self.inner.commands.read().contains_key(command)
    }

    /// Acquire a channel, declare the requests queue and start serving
    pub async fn start(&self) -> Result<()> {
        if self.inner.consumer_tag.lock().is_some() {
            return Ok(());
        }

        if let Err(e) = self.open_requests().await {
            let _ = self.inner.endpoint.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    async fn open_requests(&self) -> Result<()> {
        let channel = self.inner.endpoint.start().await?;

        let configured = self.inner.configured_queue.as_deref();
        let info = channel
            .assert_queue(configured.unwrap_or_default(), QueueOptions::exclusive(true))
            .await?;
        let binding = QueueBinding::resolve(configured, || info.queue.clone());

        let mut consumer = channel.consume(binding.name()).await?;
        tracing::debug!(requests_queue = %binding.name(), consumer_tag = %consumer.tag, "rpc server started");

        *self.inner.consumer_tag.lock() = Some(consumer.tag.clone());
        *self.inner.requests.lock() = Some(binding);

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(event) = consumer.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match event {
                    ConsumerEvent::Delivery(delivery) => {
                        // Commands run concurrently; replies go out as handlers finish
                        let channel = Arc::clone(&channel);
                        tokio::spawn(async move {
                            inner.handle_message(channel.as_ref(), delivery).await
                        });
                    }
                    ConsumerEvent::Cancelled => {
                        tracing::warn!("requests consumer cancelled by broker");
                        break;
                    }
                }
            }
        });
        *self.inner.task.lock() = Some(task);
        Ok(())
    }

    /// Stop consuming, drop a generated requests queue and release the channel
    ///
    /// Teardown continues past broker failures; the first one is returned.
    pub async fn disconnect(&self) -> Result<()> {
        let channel = self.inner.endpoint.require_channel()?;
        let mut first_error: Option<Error> = None;

        let tag = self.inner.consumer_tag.lock().take();
        if let Some(tag) = tag {
            if let Err(e) = channel.cancel(&tag).await {
                first_error.get_or_insert(e.into());
            }
        }

        let owned = match self.inner.requests.lock().as_ref() {
            Some(QueueBinding::Owned(name)) => Some(name.clone()),
            _ => None,
        };
        if let Some(name) = owned {
            if let Err(e) = channel.delete_queue(&name).await {
                first_error.get_or_insert(e.into());
            }
            *self.inner.requests.lock() = None;
        }

        if let Err(e) = self.inner.endpoint.disconnect().await {
            first_error.get_or_insert(e);
        }
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        tracing::debug!("rpc server disconnected");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The requests queue in use, generated at start when not configured
    pub fn requests_queue(&self) -> Option<String> {
        self.inner
            .requests
            .lock()
            .as_ref()
            .map(|binding| binding.name().to_string())
    }
}

impl ServerInner {
    /// Ack, run the command and publish its result to the caller
    ///
    /// Processing is at-most-once: the request is acked before the handler runs.
    async fn handle_message(&self, channel: &dyn Channel, delivery: Delivery) {
        if let Err(e) = channel.ack(&delivery).await {
            tracing::warn!(error = %e, "failed to ack request");
        }

        let properties = &delivery.properties;
        let Some(reply_to) = properties.reply_to.clone() else {
            tracing::warn!("request without replyTo dropped");
            return;
        };
        let correlation_id = properties.correlation_id.clone();
        let persistent = properties.delivery_mode != Some(DeliveryMode::Transient);

        let result = match self.dispatch_command(&delivery.payload).await {
            Ok(value) => CommandResult::success(value),
            Err(e) => CommandResult::Error(RemoteError::from_error(e.as_ref())),
        };
        let content = match result.encode() {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode command result");
                return;
            }
        };

        let reply = MessageProperties {
            correlation_id,
            delivery_mode: Some(DeliveryMode::from_persistent(persistent)),
            content_type: Some(JsonCodec::CONTENT_TYPE.to_string()),
            ..MessageProperties::default()
        };
        if let Err(e) = channel.send_to_queue(&reply_to, content, reply).await {
            tracing::error!(error = %e, %reply_to, "failed to publish command result");
        }
    }

    async fn dispatch_command(&self, payload: &[u8]) -> std::result::Result<Value, BoxError> {
        let command = decode_command(payload)?;

        let handler = self
            .commands
            .read()
            .get(&command.name)
            .cloned()
            .ok_or_else(|| Error::UnknownCommand(command.name.clone()))?;

        tracing::debug!(command = %command.name, "dispatching command");
        // Run on its own task so a panicking handler becomes an error result
        match tokio::spawn(handler(command.args)).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(Error::custom(format!(
                "handler for {} panicked",
                command.name
            ))
            .into()),
            Err(e) => Err(Error::custom(e.to_string()).into()),
        }
    }
}

/// Builder for configuring an RPC server
#[derive(Default)]
pub struct RpcServerBuilder {
    params: RpcParams,
}

impl RpcServerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue to serve; generated by the broker when unset
    pub fn requests_queue(mut self, queue: impl Into<String>) -> Self {
        self.params.requests_queue = Some(queue.into());
        self
    }

    /// Build the server
    pub fn build(self, broker: Arc<dyn Broker>) -> RpcServer {
        RpcServer::new(broker, self.params)
    }
}
