//! Courier Core - Broker-facing data model
//!
//! Message properties, queue declaration options and deliveries shared by the
//! broker contract and every endpoint built on top of it.

pub mod error;
pub mod message;

pub use error::{BrokerError, BrokerResult};
pub use message::{Delivery, DeliveryMode, MessageProperties, QueueInfo, QueueOptions};
