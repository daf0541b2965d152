use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use courier_core::{
    BrokerError, BrokerResult, Delivery, MessageProperties, QueueInfo, QueueOptions,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::transport::{Broker, Channel, ChannelNotification, Consumer, ConsumerEvent};

const DEFAULT_QUEUE_PREFIX: &str = "amq.gen-";
const DEFAULT_NOTIFICATION_CAPACITY: usize = 64;

/// In-process broker implementing the queue semantics endpoints rely on
///
/// Cloning yields another handle to the same broker. Open connections with
/// [`MemoryBroker::connect`].
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    queue_prefix: String,
    notification_capacity: usize,
    ids: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<(u64, u64), Unacked>,
    channels: HashMap<u64, Weak<ChannelShared>>,
}

struct QueueState {
    owner: Option<u64>,
    messages: VecDeque<Stored>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

struct Stored {
    properties: MessageProperties,
    payload: Vec<u8>,
    expires_at: Option<Instant>,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    message: Stored,
}

struct ConsumerSlot {
    tag: String,
    channel: Arc<ChannelShared>,
    tx: mpsc::UnboundedSender<ConsumerEvent>,
}

struct ChannelShared {
    id: u64,
    connection: u64,
    closed: AtomicBool,
    next_delivery_tag: AtomicU64,
    notify: broadcast::Sender<ChannelNotification>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a broker with default settings
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for configuring the broker
    pub fn builder() -> MemoryBrokerBuilder {
        MemoryBrokerBuilder::new()
    }

    /// Open a new connection
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            id: self.next_id(),
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether a queue with this name currently exists
    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.state.lock().queues.contains_key(name)
    }

    /// Messages waiting in a queue, not counting expired ones
    pub fn message_count(&self, name: &str) -> Option<usize> {
        let mut state = self.inner.state.lock();
        let queue = state.queues.get_mut(name)?;
        queue.purge_expired(Instant::now());
        Some(queue.messages.len())
    }

    /// Deliveries handed out but not yet acknowledged, across all channels
    pub fn unacked_count(&self) -> usize {
        self.inner.state.lock().unacked.len()
    }

    /// Raise a channel error notification on every open channel
    pub fn fail_channels(&self, message: &str) {
        let state = self.inner.state.lock();
        for channel in state.channels.values().filter_map(Weak::upgrade) {
            if !channel.closed.load(Ordering::SeqCst) {
                let _ = channel
                    .notify
                    .send(ChannelNotification::Error(message.to_string()));
            }
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn open_channel(&self, connection: u64) -> MemoryChannel {
        let (notify, _) = broadcast::channel(self.inner.notification_capacity);
        let shared = Arc::new(ChannelShared {
            id: self.next_id(),
            connection,
            closed: AtomicBool::new(false),
            next_delivery_tag: AtomicU64::new(0),
            notify,
        });
        self.inner
            .state
            .lock()
            .channels
            .insert(shared.id, Arc::downgrade(&shared));
        tracing::trace!(channel = shared.id, connection, "memory channel opened");
        MemoryChannel {
            shared,
            broker: self.clone(),
        }
    }

    fn close_channel(&self, channel: &ChannelShared) {
        let mut state = self.inner.state.lock();
        state.channels.remove(&channel.id);

        for queue in state.queues.values_mut() {
            queue.consumers.retain(|slot| slot.channel.id != channel.id);
        }

        let tags: Vec<(u64, u64)> = state
            .unacked
            .keys()
            .filter(|(channel_id, _)| *channel_id == channel.id)
            .copied()
            .collect();
        let mut touched = Vec::new();
        // Requeue in delivery order, at the head of their queues
        let mut requeue: Vec<(u64, Unacked)> = tags
            .into_iter()
            .filter_map(|key| state.unacked.remove(&key).map(|u| (key.1, u)))
            .collect();
        requeue.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, unacked) in requeue {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.messages.push_front(message);
                touched.push(unacked.queue);
            }
        }

        let now = Instant::now();
        for name in touched {
            dispatch(&mut state, &name, now);
        }
    }

    fn close_connection(&self, connection: u64) {
        let channels: Vec<Arc<ChannelShared>> = {
            let state = self.inner.state.lock();
            state
                .channels
                .values()
                .filter_map(Weak::upgrade)
                .filter(|channel| channel.connection == connection)
                .collect()
        };
        for channel in channels {
            if !channel.closed.swap(true, Ordering::SeqCst) {
                self.close_channel(&channel);
            }
        }

        let mut state = self.inner.state.lock();
        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            remove_queue(&mut state, &name);
        }
    }
}

/// Builder for configuring a memory broker
#[derive(Default)]
pub struct MemoryBrokerBuilder {
    queue_prefix: Option<String>,
    notification_capacity: Option<usize>,
}

impl MemoryBrokerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the prefix of broker-generated queue names
    pub fn queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = Some(prefix.into());
        self
    }

    /// Set how many notifications a lagging channel subscriber may miss
    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = Some(capacity.max(1));
        self
    }

    /// Build the broker
    pub fn build(self) -> MemoryBroker {
        MemoryBroker {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                queue_prefix: self
                    .queue_prefix
                    .unwrap_or_else(|| DEFAULT_QUEUE_PREFIX.to_string()),
                notification_capacity: self
                    .notification_capacity
                    .unwrap_or(DEFAULT_NOTIFICATION_CAPACITY),
                ids: AtomicU64::new(0),
            }),
        }
    }
}

/// A connection to a [`MemoryBroker`]
///
/// Exclusive queues belong to the connection that declared them and are
/// deleted when it closes.
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryConnection {
    /// Close every channel of this connection and delete its exclusive queues
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(connection = self.id, "memory connection closed");
        self.broker.close_connection(self.id);
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait::async_trait]
impl Broker for MemoryConnection {
    async fn create_channel(&self) -> BrokerResult<Arc<dyn Channel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(Arc::new(self.broker.open_channel(self.id)))
    }
}

/// A channel on a [`MemoryConnection`]
pub struct MemoryChannel {
    shared: Arc<ChannelShared>,
    broker: MemoryBroker,
}

impl MemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    fn check_owner(&self, name: &str, queue: &QueueState) -> BrokerResult<()> {
        match queue.owner {
            Some(owner) if owner != self.shared.connection => Err(BrokerError::ResourceLocked(
                format!("cannot obtain exclusive access to locked queue '{name}'"),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Channel for MemoryChannel {
    async fn assert_queue(&self, name: &str, options: QueueOptions) -> BrokerResult<QueueInfo> {
        self.ensure_open()?;

        let name = if name.is_empty() {
            format!(
                "{}{}",
                self.broker.inner.queue_prefix,
                uuid::Uuid::new_v4().simple()
            )
        } else {
            name.to_string()
        };

        let mut state = self.broker.inner.state.lock();
        let now = Instant::now();
        match state.queues.get_mut(&name) {
            Some(queue) => {
                self.check_owner(&name, queue)?;
                if queue.owner.is_some() != options.exclusive {
                    return Err(BrokerError::PreconditionFailed(format!(
                        "inequivalent arg 'exclusive' for queue '{name}'"
                    )));
                }
                queue.purge_expired(now);
            }
            None => {
                let owner = options.exclusive.then_some(self.shared.connection);
                state.queues.insert(name.clone(), QueueState::new(owner));
                tracing::trace!(queue = %name, exclusive = options.exclusive, "memory queue declared");
            }
        }

        let queue = &state.queues[&name];
        Ok(QueueInfo {
            message_count: queue.messages.len(),
            consumer_count: queue.consumers.len(),
            queue: name,
        })
    }

    async fn consume(&self, queue_name: &str) -> BrokerResult<Consumer> {
        self.ensure_open()?;

        let tag = format!("amq.ctag-{}", self.broker.next_id());
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.broker.inner.state.lock();
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::QueueNotFound(queue_name.to_string()))?;
        self.check_owner(queue_name, queue)?;
        queue.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            channel: Arc::clone(&self.shared),
            tx,
        });
        dispatch(&mut state, queue_name, Instant::now());

        Ok(Consumer {
            tag,
            deliveries: rx,
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.ensure_open()?;

        let mut state = self.broker.inner.state.lock();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|slot| {
                !(slot.tag == consumer_tag && slot.channel.id == self.shared.id)
            });
        }
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        self.ensure_open()?;

        let mut state = self.broker.inner.state.lock();
        state
            .unacked
            .remove(&(self.shared.id, delivery.delivery_tag))
            .map(|_| ())
            .ok_or_else(|| {
                BrokerError::PreconditionFailed(format!(
                    "unknown delivery tag {}",
                    delivery.delivery_tag
                ))
            })
    }

    async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> BrokerResult<()> {
        self.ensure_open()?;

        let now = Instant::now();
        let mut state = self.broker.inner.state.lock();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            if properties.is_mandatory() {
                tracing::trace!(queue = %queue_name, "unroutable mandatory message returned");
                let _ = self.shared.notify.send(ChannelNotification::Returned {
                    routing_key: queue_name.to_string(),
                    properties,
                });
            }
            return Ok(());
        };

        queue.messages.push_back(Stored {
            expires_at: properties.ttl().map(|ttl| now + ttl),
            properties,
            payload,
            redelivered: false,
        });
        dispatch(&mut state, queue_name, now);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<()> {
        self.ensure_open()?;

        let mut state = self.broker.inner.state.lock();
        if let Some(queue) = state.queues.get(name) {
            self.check_owner(name, queue)?;
            remove_queue(&mut state, name);
        }
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }
        self.broker.close_channel(&self.shared);
        tracing::trace!(channel = self.shared.id, "memory channel closed");
        Ok(())
    }

    fn notifications(&self) -> broadcast::Receiver<ChannelNotification> {
        self.shared.notify.subscribe()
    }
}

impl QueueState {
    fn new(owner: Option<u64>) -> Self {
        Self {
            owner,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        self.messages.retain(|message| !message.is_expired(now));
    }
}

impl Stored {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Hand buffered messages to the queue's consumers, round-robin
fn dispatch(state: &mut BrokerState, queue_name: &str, now: Instant) {
    let Some(queue) = state.queues.get_mut(queue_name) else {
        return;
    };

    while !queue.consumers.is_empty() {
        let Some(message) = queue.messages.pop_front() else {
            break;
        };
        if message.is_expired(now) {
            continue;
        }

        let index = queue.cursor % queue.consumers.len();
        let slot = &queue.consumers[index];
        if slot.tx.is_closed() || slot.channel.closed.load(Ordering::SeqCst) {
            queue.consumers.remove(index);
            queue.messages.push_front(message);
            continue;
        }
        queue.cursor = index + 1;

        let delivery_tag = slot.channel.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let delivery = Delivery {
            delivery_tag,
            routing_key: queue_name.to_string(),
            redelivered: message.redelivered,
            properties: message.properties.clone(),
            payload: message.payload.clone(),
        };
        if slot.tx.send(ConsumerEvent::Delivery(delivery)).is_err() {
            queue.consumers.remove(index);
            queue.messages.push_front(message);
            continue;
        }
        state.unacked.insert(
            (slot.channel.id, delivery_tag),
            Unacked {
                queue: queue_name.to_string(),
                message,
            },
        );
    }
}

fn remove_queue(state: &mut BrokerState, name: &str) {
    if let Some(queue) = state.queues.remove(name) {
        for slot in queue.consumers {
            let _ = slot.tx.send(ConsumerEvent::Cancelled);
        }
        tracing::trace!(queue = %name, "memory queue deleted");
    }
}
