use thiserror::Error;

/// Failures reported by a broker implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Channel closed")]
    ChannelClosed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Resource locked: {0}")]
    ResourceLocked(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    Custom(String),
}

impl BrokerError {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
