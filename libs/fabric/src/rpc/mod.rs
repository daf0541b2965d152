//! Request/reply commands over broker queues
//!
//! The client publishes commands to a requests queue with `replyTo` and
//! `correlationId` properties; the server replies to that queue echoing the
//! correlation id.

pub mod client;
pub mod server;

pub use self::client::{ReplyHandle, RpcClient, RpcClientBuilder};
pub use self::server::{BoxError, HandlerFuture, RpcServer, RpcServerBuilder};
