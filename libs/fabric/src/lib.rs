//! Courier Fabric - RPC and event streams over a message broker
//!
//! Provides request/reply commands ([`RpcClient`], [`RpcServer`]) and
//! stream-like event delivery ([`EventSender`], [`EventReceiver`]) on top of
//! any broker implementing the [`transport::Broker`] contract. An in-process
//! [`transport::MemoryBroker`] is included.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_fabric::{transport::{Broker, MemoryBroker}, RpcClient, RpcServer};
//! use serde_json::{json, Value};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = MemoryBroker::new();
//! let connection: Arc<dyn Broker> = Arc::new(broker.connect());
//!
//! let server = RpcServer::builder()
//!     .requests_queue("greetings")
//!     .build(connection.clone());
//! server.add_command("hello", |args: Vec<Value>| async move {
//!     let name = args.first().and_then(Value::as_str).unwrap_or("stranger").to_string();
//!     Ok::<_, courier_fabric::Error>(json!({ "message": format!("Hello, {name}!") }))
//! });
//! server.start().await?;
//!
//! let client = RpcClient::builder()
//!     .requests_queue("greetings")
//!     .build(connection)?;
//! client.start().await?;
//! let reply = client.call("hello", vec![json!("Alisa")]).await?;
//! assert_eq!(reply, json!({ "message": "Hello, Alisa!" }));
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod params;
pub mod request;
pub mod rpc;
pub mod transport;
pub mod wire;

// Re-exports for convenience
pub use courier_core::{DeliveryMode, MessageProperties, QueueOptions};
pub use endpoint::{Endpoint, QueueBinding};
pub use error::{CancelReason, Error, RemoteError, Result};
pub use events::{EventReceiver, EventSender, StreamEvent};
pub use params::{EventsParams, RpcParams};
pub use rpc::{ReplyHandle, RpcClient, RpcServer};
