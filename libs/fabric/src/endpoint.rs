use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::transport::{Broker, Channel};

/// Owner of a single broker channel
///
/// The channel is acquired by [`Endpoint::start`] and released by
/// [`Endpoint::disconnect`]. RPC clients, servers and event endpoints layer
/// their queues and consumers on top of it.
///
/// `start` is not guarded against concurrent callers: two racing calls may
/// both open a channel, and only one is kept.
pub struct Endpoint {
    broker: Arc<dyn Broker>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
}

impl Endpoint {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            channel: Mutex::new(None),
        }
    }

    /// Acquire a channel, no-op when one is already held
    pub async fn start(&self) -> Result<Arc<dyn Channel>> {
        if let Some(channel) = self.channel() {
            return Ok(channel);
        }

        let channel = self.broker.create_channel().await?;
        tracing::debug!("channel acquired");
        *self.channel.lock() = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Release the channel, no-op when none is held
    pub async fn disconnect(&self) -> Result<()> {
        match self.take_channel() {
            Some(channel) => {
                channel.close().await?;
                tracing::debug!("channel released");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// The current channel, if started
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.lock().clone()
    }

    /// The current channel, or [`Error::NotStarted`]
    pub fn require_channel(&self) -> Result<Arc<dyn Channel>> {
        self.channel().ok_or(Error::NotStarted)
    }

    /// Detach the channel without closing it
    ///
    /// Exactly one caller observes `Some` per acquired channel.
    pub fn take_channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.lock().take()
    }

    pub fn is_started(&self) -> bool {
        self.channel.lock().is_some()
    }
}

/// A queue used by an endpoint and who is responsible for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueBinding {
    /// Name generated at start; deleted by this side on teardown
    Owned(String),
    /// Name given by configuration; never deleted by this side
    Shared(String),
}

impl QueueBinding {
    pub fn name(&self) -> &str {
        match self {
            Self::Owned(name) | Self::Shared(name) => name,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }

    /// Bind a configured name, or adopt `generated` when none was configured
    pub fn resolve(configured: Option<&str>, generated: impl FnOnce() -> String) -> Self {
        match configured.filter(|name| !name.is_empty()) {
            Some(name) => Self::Shared(name.to_string()),
            None => Self::Owned(generated()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;

    #[test]
    fn resolve_marks_configured_names_shared() {
        assert_eq!(
            QueueBinding::resolve(Some("jobs"), || unreachable!()),
            QueueBinding::Shared("jobs".to_string())
        );
        assert_eq!(
            QueueBinding::resolve(Some(""), || "gen".to_string()),
            QueueBinding::Owned("gen".to_string())
        );
        assert!(QueueBinding::resolve(None, || "gen".to_string()).is_owned());
    }

    #[tokio::test]
    async fn start_and_disconnect_are_idempotent() {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::new(Arc::new(broker.connect()));

        assert!(matches!(endpoint.require_channel(), Err(Error::NotStarted)));
        endpoint.disconnect().await.unwrap();

        let first = endpoint.start().await.unwrap();
        let second = endpoint.start().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        endpoint.disconnect().await.unwrap();
        assert!(!endpoint.is_started());
        endpoint.disconnect().await.unwrap();
    }
}
