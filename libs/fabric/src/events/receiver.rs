use std::sync::{Arc, Weak};

use courier_core::{Delivery, QueueOptions};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::codec::{Codec, JsonCodec};
use crate::endpoint::{Endpoint, QueueBinding};
use crate::error::{Error, Result};
use crate::events::emitter::{Emitter, EventKind, ListenerId, StreamEvent};
use crate::params::{configured, EventsParams};
use crate::transport::{Broker, Channel, Consumer, ConsumerEvent};

/// Reading half of an event stream
///
/// Turns the messages of one queue into `data` occurrences. When the queue
/// is deleted upstream it reports `end`, tears itself down and reports
/// `close`.
#[derive(Clone)]
pub struct EventReceiver {
    inner: Arc<ReceiverInner>,
}

struct ReceiverInner {
    endpoint: Endpoint,
    params: EventsParams,
    queue: Mutex<Option<QueueBinding>>,
    consumer_tag: Mutex<Option<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
    emitter: Emitter,
}

impl EventReceiver {
    pub fn new(broker: Arc<dyn Broker>, params: EventsParams) -> Self {
        Self {
            inner: Arc::new(ReceiverInner {
                endpoint: Endpoint::new(broker),
                params,
                queue: Mutex::new(None),
                consumer_tag: Mutex::new(None),
                task: Mutex::new(None),
                emitter: Emitter::new(),
            }),
        }
    }

    /// Create a builder for configuring the receiver
    pub fn builder() -> EventReceiverBuilder {
        EventReceiverBuilder::new()
    }

    /// Declare the queue and start consuming it
    ///
    /// Returns the resolved queue name, to be handed to the paired sender.
    /// Fails when already started.
    pub async fn start(&self) -> Result<String> {
        if self.inner.emitter.is_closed() {
            return Err(Error::Stopped);
        }
        if self.inner.endpoint.is_started() {
            return Err(Error::AlreadyStarted);
        }

        let channel = self.inner.endpoint.start().await?;
        match self.open_queue(&channel).await {
            Ok((name, consumer)) => {
                let weak = Arc::downgrade(&self.inner);
                let task = tokio::spawn(consume(weak, channel, consumer));
                *self.inner.task.lock() = Some(task);
                Ok(name)
            }
            Err(e) => {
                if let Some(channel) = self.inner.endpoint.take_channel() {
                    let _ = channel.close().await;
                }
                Err(e)
            }
        }
    }

    async fn open_queue(&self, channel: &Arc<dyn Channel>) -> Result<(String, Consumer)> {
        let configured = configured(&self.inner.params.queue_name);
        let info = channel
            .assert_queue(
                configured.unwrap_or_default(),
                QueueOptions::exclusive(self.inner.params.exclusive),
            )
            .await?;
        let binding = QueueBinding::resolve(configured, || info.queue.clone());
        let name = binding.name().to_string();
        *self.inner.queue.lock() = Some(binding);

        let consumer = channel.consume(&name).await?;
        tracing::debug!(queue = %name, consumer_tag = %consumer.tag, "event receiver started");
        *self.inner.consumer_tag.lock() = Some(consumer.tag.clone());
        Ok((name, consumer))
    }

    /// Delete a generated queue, close the channel and report `close`
    ///
    /// No-op when not started.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    /// Listen to decoded messages
    pub fn set_handler<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.emitter.on_data(handler)
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

    /// The consumed queue, generated at start when not configured
    pub fn queue_name(&self) -> Option<String> {
        self.inner
            .queue
            .lock()
            .as_ref()
            .map(|binding| binding.name().to_string())
    }

    pub fn is_started(&self) -> bool {
        self.inner.endpoint.is_started()
    }
}

impl ReceiverInner {
    async fn handle_delivery(&self, channel: &dyn Channel, delivery: Delivery) {
        if let Err(e) = channel.ack(&delivery).await {
            tracing::warn!(error = %e, "failed to ack event");
        }

        match JsonCodec.decode::<Value>(&delivery.payload) {
            Ok(value) => {
                self.emitter.emit(StreamEvent::Data(value));
            }
            Err(e) => {
                tracing::debug!(error = %e, queue = %delivery.routing_key, "undecodable event");
                let error = Error::MalformedPayload(e.to_string());
                self.emitter.emit(StreamEvent::Error(Arc::new(error)));
            }
        }
    }

    async fn disconnect(&self) {
        let Some(channel) = self.endpoint.take_channel() else {
            return;
        };

        // Stop consuming first so deleting our own queue is not seen as `end`
        let tag = self.consumer_tag.lock().take();
        if let Some(tag) = tag {
            if let Err(e) = channel.cancel(&tag).await {
                tracing::debug!(error = %e, consumer_tag = %tag, "ignoring consumer cancel failure");
            }
        }

        let owned = match self.queue.lock().as_ref() {
            Some(QueueBinding::Owned(name)) => Some(name.clone()),
            _ => None,
        };
        if let Some(name) = owned {
            // The paired sender may have deleted it already
            if let Err(e) = channel.delete_queue(&name).await {
                tracing::debug!(error = %e, queue = %name, "ignoring queue delete failure");
            }
        }

        if let Err(e) = channel.close().await {
            tracing::warn!(error = %e, "event receiver channel close failed");
            self.emitter.emit(StreamEvent::Error(Arc::new(e.into())));
        }
        tracing::debug!("event receiver disconnected");
        self.emitter.emit(StreamEvent::Close);

        // Last step: may abort the calling task when invoked from the consumer
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn consume(inner: Weak<ReceiverInner>, channel: Arc<dyn Channel>, mut consumer: Consumer) {
    while let Some(event) = consumer.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            ConsumerEvent::Delivery(delivery) => {
                inner.handle_delivery(channel.as_ref(), delivery).await
            }
            ConsumerEvent::Cancelled => {
                if !inner.endpoint.is_started() {
                    // Local teardown already in progress
                    break;
                }
                tracing::debug!(tag = %consumer.tag, "event queue closed upstream");
                inner.emitter.emit(StreamEvent::End);
                inner.disconnect().await;
                break;
            }
        }
    }
}

/// Builder for configuring an event receiver
#[derive(Default)]
pub struct EventReceiverBuilder {
    params: EventsParams,
}

impl EventReceiverBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue to consume; generated by the broker when unset
    pub fn queue_name(mut self, queue: impl Into<String>) -> Self {
        self.params.queue_name = Some(queue.into());
        self
    }

    /// Set the queue exclusivity flag
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.params.exclusive = exclusive;
        self
    }

    /// Build the receiver
    pub fn build(self, broker: Arc<dyn Broker>) -> EventReceiver {
        EventReceiver::new(broker, self.params)
    }
}
