use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delivery mode of a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Volatile, AMQP delivery mode 1
    Transient,
    /// Non-volatile, AMQP delivery mode 2
    Persistent,
}

impl DeliveryMode {
    /// Anything not explicitly marked volatile counts as persistent
    pub fn from_persistent(persistent: bool) -> Self {
        if persistent {
            Self::Persistent
        } else {
            Self::Transient
        }
    }

    pub fn is_persistent(self) -> bool {
        matches!(self, Self::Persistent)
    }
}

/// Properties attached to a message on publish, and read back on delivery
///
/// Every field is optional so that several layers of options can be stacked
/// with [`MessageProperties::overlay`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageProperties {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    /// Time-to-live in milliseconds, as a decimal string
    pub expiration: Option<String>,
    /// Return the message to the publisher when it cannot be routed
    pub mandatory: Option<bool>,
    pub delivery_mode: Option<DeliveryMode>,
    pub content_type: Option<String>,
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Value>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl.as_millis().to_string());
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = Some(mandatory);
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = Some(mode);
        self
    }

    pub fn persistent(self, persistent: bool) -> Self {
        self.delivery_mode(DeliveryMode::from_persistent(persistent))
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Stack `top` over `self`: every field set in `top` wins, headers are
    /// merged key by key.
    pub fn overlay(mut self, top: &MessageProperties) -> Self {
        fn pick<T: Clone>(base: &mut Option<T>, top: &Option<T>) {
            if top.is_some() {
                base.clone_from(top);
            }
        }

        pick(&mut self.reply_to, &top.reply_to);
        pick(&mut self.correlation_id, &top.correlation_id);
        pick(&mut self.expiration, &top.expiration);
        pick(&mut self.mandatory, &top.mandatory);
        pick(&mut self.delivery_mode, &top.delivery_mode);
        pick(&mut self.content_type, &top.content_type);
        pick(&mut self.priority, &top.priority);
        for (key, value) in &top.headers {
            self.headers.insert(key.clone(), value.clone());
        }
        self
    }

    /// Parsed expiration, `None` when unset or not a number of milliseconds
    pub fn ttl(&self) -> Option<Duration> {
        self.expiration
            .as_deref()
            .and_then(|ms| ms.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory.unwrap_or(false)
    }
}

/// Options for declaring a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Usable only by the declaring connection
    pub exclusive: bool,
}

impl QueueOptions {
    pub fn exclusive(exclusive: bool) -> Self {
        Self { exclusive }
    }
}

/// Broker answer to a queue declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// Resolved queue name, generated by the broker when declared without one
    pub queue: String,
    pub message_count: usize,
    pub consumer_count: usize,
}

/// A message handed to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge the message
    pub delivery_tag: u64,
    /// Queue the message was routed to
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}
