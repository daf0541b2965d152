use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::events::{EventSender, StreamEvent};
use crate::rpc::RpcClient;
use crate::transport::Broker;

/// Perform a one-off command call
///
/// Starts a client with a generated reply queue, sends the command, waits for
/// the outcome and disconnects.
pub async fn request(
    broker: Arc<dyn Broker>,
    requests_queue: &str,
    command: &str,
    args: Vec<Value>,
) -> Result<Value> {
    let client = RpcClient::builder()
        .requests_queue(requests_queue)
        .build(broker)?;
    client.start().await?;
    let outcome = client.call(command, args).await;
    client.disconnect().await?;
    outcome
}

/// Publish a single event without waiting for a consumer (fire-and-forget)
///
/// Unlike [`EventSender::send`], a failed publish is returned as an error.
pub async fn send_event<T>(broker: Arc<dyn Broker>, queue: &str, message: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let sender = EventSender::builder().queue_name(queue).build(broker);
    let mut events = sender.subscribe();
    sender.start().await?;
    sender.send(message).await?;
    sender.disconnect().await;

    while let Ok(event) = events.try_recv() {
        if let StreamEvent::Error(error) = event {
            return Err(Error::custom(error.to_string()));
        }
    }
    Ok(())
}
