use std::sync::Arc;

use courier_core::{BrokerResult, Delivery, MessageProperties, QueueInfo, QueueOptions};
use tokio::sync::{broadcast, mpsc};

pub mod memory;

pub use self::memory::{MemoryBroker, MemoryBrokerBuilder, MemoryChannel, MemoryConnection};

/// A connection to a message broker
///
/// The only thing endpoints need from a connection is a fresh channel.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Open a new channel on this connection
    async fn create_channel(&self) -> BrokerResult<Arc<dyn Channel>>;
}

/// A broker channel: queue management, publishing and consuming
///
/// Each endpoint owns exactly one channel and never shares it.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    /// Declare a queue, creating it if needed
    ///
    /// An empty `name` asks the broker to generate one.
    async fn assert_queue(&self, name: &str, options: QueueOptions) -> BrokerResult<QueueInfo>;

    /// Start consuming a queue
    async fn consume(&self, queue: &str) -> BrokerResult<Consumer>;

    /// Stop a consumer started on this channel
    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    /// Acknowledge a delivery received on this channel
    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()>;

    /// Publish a message directly to a queue
    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> BrokerResult<()>;

    /// Delete a queue, cancelling its consumers
    async fn delete_queue(&self, name: &str) -> BrokerResult<()>;

    /// Close the channel
    async fn close(&self) -> BrokerResult<()>;

    /// Subscribe to returned-message and error notifications
    fn notifications(&self) -> broadcast::Receiver<ChannelNotification>;
}

/// Something that happened to a consumer's queue
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    Delivery(Delivery),
    /// The broker cancelled the consumer, typically because the queue was deleted
    Cancelled,
}

/// An active subscription to a queue
///
/// The delivery stream ends without [`ConsumerEvent::Cancelled`] when the
/// consumer is cancelled locally or its channel closes.
pub struct Consumer {
    pub tag: String,
    pub deliveries: mpsc::UnboundedReceiver<ConsumerEvent>,
}

impl Consumer {
    pub async fn next(&mut self) -> Option<ConsumerEvent> {
        self.deliveries.recv().await
    }
}

/// Channel-level notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotification {
    /// A mandatory publish could not be routed and came back
    Returned {
        routing_key: String,
        properties: MessageProperties,
    },
    Error(String),
}
