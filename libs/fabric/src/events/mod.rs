//! Stream-like event delivery over a single queue
//!
//! An [`EventSender`] publishes messages to a queue, an [`EventReceiver`]
//! consumes it and reports `data`, `error`, `end` and `close` occurrences
//! through an [`Emitter`].

pub mod emitter;
pub mod receiver;
pub mod sender;

pub use self::emitter::{Emitter, EventKind, ListenerId, StreamEvent};
pub use self::receiver::{EventReceiver, EventReceiverBuilder};
pub use self::sender::{EventSender, EventSenderBuilder};
