use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_core::{BrokerError, MessageProperties, QueueOptions};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::codec::{Codec, JsonCodec};
use crate::endpoint::{Endpoint, QueueBinding};
use crate::error::{Error, Result};
use crate::events::emitter::{Emitter, EventKind, ListenerId, StreamEvent};
use crate::params::{configured, EventsParams};
use crate::transport::{Broker, ChannelNotification};

/// Writing half of an event stream
///
/// Publishes messages to one queue with a time-to-live. When a message comes
/// back unroutable because the queue is gone, the sender disconnects itself.
/// Broker failures are reported as `error` occurrences, not returned.
#[derive(Clone)]
pub struct EventSender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    endpoint: Endpoint,
    params: EventsParams,
    queue: Mutex<Option<QueueBinding>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    emitter: Emitter,
}

impl EventSender {
    pub fn new(broker: Arc<dyn Broker>, params: EventsParams) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                endpoint: Endpoint::new(broker),
                params,
                queue: Mutex::new(None),
                watcher: Mutex::new(None),
                emitter: Emitter::new(),
            }),
        }
    }

    /// Create a builder for configuring the sender
    pub fn builder() -> EventSenderBuilder {
        EventSenderBuilder::new()
    }

    /// Acquire a channel, declare the target queue and watch the channel
    ///
    /// No-op when already started. A closed sender cannot be restarted.
    pub async fn start(&self) -> Result<()> {
        if self.inner.emitter.is_closed() {
            return Err(Error::Stopped);
        }
        if self.inner.endpoint.is_started() {
            return Ok(());
        }

        let channel = self.inner.endpoint.start().await?;
        let configured = configured(&self.inner.params.queue_name);
        let info = match channel
            .assert_queue(
                configured.unwrap_or_default(),
                QueueOptions::exclusive(self.inner.params.exclusive),
            )
            .await
        {
            Ok(info) => info,
            Err(e) => {
                if let Some(channel) = self.inner.endpoint.take_channel() {
                    let _ = channel.close().await;
                }
                return Err(e.into());
            }
        };
        let binding = QueueBinding::resolve(configured, || info.queue.clone());
        tracing::debug!(queue = %binding.name(), "event sender started");
        *self.inner.queue.lock() = Some(binding);

        let notifications = channel.notifications();
        let task = tokio::spawn(watch_channel(Arc::downgrade(&self.inner), notifications));
        *self.inner.watcher.lock() = Some(task);
        Ok(())
    }

    /// Publish one message
    ///
    /// The message is sent mandatory, so an unroutable publish is returned
    /// instead of dropped. A failed publish is reported as an `error`
    /// occurrence.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let channel = self.inner.endpoint.require_channel()?;
        let queue = self.queue_name().ok_or(Error::NotStarted)?;
        let payload = JsonCodec.encode(message)?;

        let properties = MessageProperties::new()
            .content_type(JsonCodec::CONTENT_TYPE)
            .mandatory(true)
            .expiration(self.inner.params.ttl);
        if let Err(e) = channel.send_to_queue(&queue, payload, properties).await {
            tracing::warn!(error = %e, %queue, "event publish failed");
            self.inner.emitter.emit(StreamEvent::Error(Arc::new(e.into())));
        }
        Ok(())
    }

    /// Delete the target queue, then disconnect
    ///
    /// The paired receiver observes `end` once the queue is gone.
    pub async fn end(&self) -> Result<()> {
        let channel = self.inner.endpoint.require_channel()?;
        if let Some(queue) = self.queue_name() {
            if let Err(e) = channel.delete_queue(&queue).await {
                self.inner.emitter.emit(StreamEvent::Error(Arc::new(e.into())));
            }
        }
        self.inner.disconnect().await;
        Ok(())
    }

    /// Close the channel and report `close`; no-op when not started
    pub async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    /// The target queue, generated at start when not configured
    pub fn queue_name(&self) -> Option<String> {
        self.inner
            .queue
            .lock()
            .as_ref()
            .map(|binding| binding.name().to_string())
    }

    pub fn ttl(&self) -> Duration {
        self.inner.params.ttl
    }

    pub fn is_started(&self) -> bool {
        self.inner.endpoint.is_started()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.inner.emitter.on(kind, listener)
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<StreamEvent> {
        self.inner.emitter.subscribe()
    }

    pub fn events(&self) -> &Emitter {
        &self.inner.emitter
    }
}

impl SenderInner {
    async fn disconnect(&self) {
        let Some(channel) = self.endpoint.take_channel() else {
            return;
        };

        match channel.close().await {
            Ok(()) => {
                tracing::debug!("event sender disconnected");
                self.emitter.emit(StreamEvent::Close);
            }
            Err(e) => {
                tracing::warn!(error = %e, "event sender channel close failed");
                self.emitter.emit(StreamEvent::Error(Arc::new(e.into())));
            }
        }

        // Last step: may abort the calling task when invoked from the watcher
        if let Some(task) = self.watcher.lock().take() {
            task.abort();
        }
    }

    fn is_own_queue(&self, routing_key: &str) -> bool {
        self.queue
            .lock()
            .as_ref()
            .is_some_and(|binding| binding.name() == routing_key)
    }
}

async fn watch_channel(
    inner: Weak<SenderInner>,
    mut notifications: broadcast::Receiver<ChannelNotification>,
) {
    loop {
        let notification = match notifications.recv().await {
            Ok(notification) => notification,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "event sender lagged behind channel notifications");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match notification {
            ChannelNotification::Returned { routing_key, .. } => {
                if inner.is_own_queue(&routing_key) {
                    tracing::debug!(queue = %routing_key, "event returned unroutable, disconnecting");
                    inner.disconnect().await;
                    break;
                }
            }
            ChannelNotification::Error(message) => {
                let error = Error::Broker(BrokerError::Custom(message));
                inner.emitter.emit(StreamEvent::Error(Arc::new(error)));
            }
        }
    }
}

/// Builder for configuring an event sender
#[derive(Default)]
pub struct EventSenderBuilder {
    params: EventsParams,
}

impl EventSenderBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target queue; generated by the broker when unset
    pub fn queue_name(mut self, queue: impl Into<String>) -> Self {
        self.params.queue_name = Some(queue.into());
        self
    }

    /// Set the message time-to-live
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.params.ttl = ttl;
        self
    }

    /// Set the queue exclusivity flag
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.params.exclusive = exclusive;
        self
    }

    /// Build the sender
    pub fn build(self, broker: Arc<dyn Broker>) -> EventSender {
        EventSender::new(broker, self.params)
    }
}
