use std::fmt;
use std::time::Duration;

use courier_core::BrokerError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Channel is not initialized")]
    NotStarted,

    #[error("Already started")]
    AlreadyStarted,

    #[error("Endpoint was disconnected and cannot be restarted")]
    Stopped,

    #[error("sendCommand canceled due to {reason}, command:{command}, correlationId:{correlation_id}")]
    Cancelled {
        reason: CancelReason,
        command: String,
        correlation_id: String,
    },

    #[error("Unknown command {0}")]
    UnknownCommand(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// True for a pending command cancelled because no reply arrived in time
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Cancelled {
                reason: CancelReason::Timeout(_),
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a pending command was cancelled before its reply arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Timeout(Duration),
    ClientDisconnect,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(after) => write!(f, "timeout ({})", after.as_millis()),
            Self::ClientDisconnect => f.write_str("client disconnect"),
        }
    }
}

/// Error description that crossed the wire inside an ERROR command result
///
/// Carries text only; the original error value stays on the side that raised it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
#[serde(default)]
pub struct RemoteError {
    pub message: String,
    pub name: String,
    pub stack: String,
}

impl Default for RemoteError {
    fn default() -> Self {
        Self {
            message: String::new(),
            name: "Error".to_string(),
            stack: String::new(),
        }
    }
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let message = message.into();
        let stack = format!("{name}: {message}");
        Self {
            message,
            name,
            stack,
        }
    }

    /// Flatten any error into its wire description
    ///
    /// The `source` chain becomes the stack text, one cause per line.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        if let Some(remote) = error.downcast_ref::<RemoteError>() {
            return remote.clone();
        }

        let name = match error.downcast_ref::<Error>() {
            Some(Error::UnknownCommand(_)) => "UnknownCommand",
            Some(Error::MalformedPayload(_)) => "MalformedPayload",
            Some(Error::Codec(_)) => "CodecError",
            _ => "Error",
        };

        let mut stack = format!("{name}: {error}");
        let mut cause = error.source();
        while let Some(inner) = cause {
            stack.push_str(&format!("\n    caused by: {inner}"));
            cause = inner.source();
        }

        Self {
            message: error.to_string(),
            name: name.to_string(),
            stack,
        }
    }
}
