use std::time::Duration;

use courier_core::MessageProperties;
use serde::{Deserialize, Serialize};

/// Per-command timeout used when none is configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Event message time-to-live used when none is configured
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Configuration shared by RPC clients and servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RpcParams {
    /// Queue commands are sent to; required by clients
    pub requests_queue: Option<String>,
    /// Client reply queue; unset means a generated, client-owned queue
    pub replies_queue: Option<String>,
    /// Milliseconds before a pending command is cancelled
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Properties applied under per-call options
    pub default_message_options: MessageProperties,
}

impl Default for RpcParams {
    fn default() -> Self {
        Self {
            requests_queue: None,
            replies_queue: None,
            timeout: DEFAULT_TIMEOUT,
            default_message_options: MessageProperties::default(),
        }
    }
}

/// Configuration of an event sender or receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventsParams {
    /// Unset means a broker-generated queue owned by this side
    pub queue_name: Option<String>,
    #[serde(rename = "TTL", with = "duration_ms")]
    pub ttl: Duration,
    pub exclusive: bool,
}

impl Default for EventsParams {
    fn default() -> Self {
        Self {
            queue_name: None,
            ttl: DEFAULT_TTL,
            exclusive: false,
        }
    }
}

pub(crate) fn configured(name: &Option<String>) -> Option<&str> {
    name.as_deref().filter(|name| !name.is_empty())
}

mod duration_ms {
    use std::time::Duration;

    use serde::ser::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis())
            .map_err(|_| S::Error::custom(format!("duration {value:?} overflows milliseconds")))?;
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
