use std::sync::Arc;
use std::time::Duration;

use courier_core::{BrokerError, DeliveryMode, MessageProperties, QueueOptions};
use courier_fabric::{
    error::{CancelReason, Error},
    request::request,
    rpc::{RpcClient, RpcServer},
    transport::{Broker, ConsumerEvent, MemoryBroker},
    wire::{decode_result, encode_command, CommandResult},
};
use serde_json::{json, Value};
use tracing_test::traced_test;

/// Helper to open a fresh connection on a broker
fn connect(broker: &MemoryBroker) -> Arc<dyn Broker> {
    Arc::new(broker.connect())
}

/// Helper to start a server answering `hello`
async fn hello_server(broker: &MemoryBroker, queue: &str) -> RpcServer {
    let server = RpcServer::builder()
        .requests_queue(queue)
        .build(connect(broker));
    server.add_command("hello", |args: Vec<Value>| async move {
        let name = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::custom("hello expects a name"))?
            .to_string();
        Ok::<_, Error>(json!({ "message": format!("Hello, {name}!") }))
    });
    server.start().await.unwrap();
    server
}

async fn started_client(broker: &MemoryBroker, queue: &str) -> RpcClient {
    let client = RpcClient::builder()
        .requests_queue(queue)
        .build(connect(broker))
        .unwrap();
    client.start().await.unwrap();
    client
}

#[tokio::test]
async fn hello_round_trip() {
    let broker = MemoryBroker::new();
    let _server = hello_server(&broker, "greetings").await;
    let client = started_client(&broker, "greetings").await;

    let reply = client.call("hello", vec![json!("Alisa")]).await.unwrap();

    assert_eq!(reply, json!({ "message": "Hello, Alisa!" }));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    let broker = MemoryBroker::new();
    let _server = hello_server(&broker, "greetings").await;
    let client = started_client(&broker, "greetings").await;

    let err = client.call("hello2", vec![json!("Alisa")]).await.unwrap_err();

    match err {
        Error::Remote(remote) => {
            assert_eq!(remote.message, "Unknown command hello2");
            assert_eq!(remote.name, "UnknownCommand");
        }
        other => panic!("Expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn handler_failure_becomes_remote_error() {
    let broker = MemoryBroker::new();
    let _server = hello_server(&broker, "greetings").await;
    let client = started_client(&broker, "greetings").await;

    // No name argument makes the handler fail
    let err = client.call("hello", vec![]).await.unwrap_err();

    assert!(matches!(err, Error::Remote(ref remote) if remote.message == "hello expects a name"));
    assert_eq!(err.to_string(), "hello expects a name");
}

#[tokio::test]
async fn panicking_handler_does_not_stop_server() {
    let broker = MemoryBroker::new();
    let server = hello_server(&broker, "greetings").await;
    server.add_command("explode", |_args: Vec<Value>| async move {
        if true {
            panic!("kaboom");
        }
        Ok::<Value, Error>(Value::Null)
    });
    let client = started_client(&broker, "greetings").await;

    let err = client.call("explode", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("panicked"));

    let reply = client.call("hello", vec![json!("Bob")]).await.unwrap();
    assert_eq!(reply["message"], "Hello, Bob!");
}

#[tokio::test]
async fn last_registration_wins() {
    let broker = MemoryBroker::new();
    let server = hello_server(&broker, "greetings").await;
    server
        .add_command("hello", |_args: Vec<Value>| async { Ok::<_, Error>(json!(1)) })
        .add_command("hello", |_args: Vec<Value>| async { Ok::<_, Error>(json!(2)) });
    let client = started_client(&broker, "greetings").await;

    assert!(server.has_command("hello"));
    assert_eq!(client.call("hello", vec![]).await.unwrap(), json!(2));
}

#[tokio::test(start_paused = true)]
async fn command_times_out_without_reply() {
    let broker = MemoryBroker::new();
    // Nobody consumes the requests queue
    let client = started_client(&broker, "void").await;

    let handle = client
        .send_command("hello", vec![json!("Alisa")], MessageProperties::default())
        .await
        .unwrap();
    let err = handle.await.unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(
        err.to_string(),
        "sendCommand canceled due to timeout (60000), command:hello, correlationId:0"
    );
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn late_reply_after_timeout_is_dropped() {
    let broker = MemoryBroker::new();
    let server = hello_server(&broker, "slow").await;
    server.add_command("slow", |_args: Vec<Value>| async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok::<_, Error>(json!("late"))
    });
    let client = RpcClient::builder()
        .requests_queue("slow")
        .timeout(Duration::from_millis(100))
        .build(connect(&broker))
        .unwrap();
    client.start().await.unwrap();

    let err = client.call("slow", vec![]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Cancelled {
            reason: CancelReason::Timeout(_),
            ..
        }
    ));

    // Let the late reply arrive and be discarded
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.pending_count(), 0);
    assert_eq!(broker.unacked_count(), 0);

    let reply = client.call("hello", vec![json!("Alisa")]).await.unwrap();
    assert_eq!(reply["message"], "Hello, Alisa!");
}

#[tokio::test]
#[traced_test]
async fn disconnect_rejects_all_pending_commands() {
    let broker = MemoryBroker::new();
    let client = started_client(&broker, "void").await;
    let replies_queue = client.replies_queue().unwrap();

    let mut handles = Vec::new();
    for i in 0..3 {
        let handle = client
            .send_command("work", vec![json!(i)], MessageProperties::default())
            .await
            .unwrap();
        handles.push(handle);
    }
    assert_eq!(client.pending_count(), 3);

    client.disconnect().await.unwrap();

    for handle in handles {
        let correlation_id = handle.correlation_id().to_string();
        match handle.await.unwrap_err() {
            Error::Cancelled {
                reason,
                command,
                correlation_id: id,
            } => {
                assert_eq!(reason, CancelReason::ClientDisconnect);
                assert_eq!(command, "work");
                assert_eq!(id, correlation_id);
            }
            other => panic!("Expected cancellation, got {:?}", other),
        }
    }
    assert_eq!(client.pending_count(), 0);
    assert!(!broker.queue_exists(&replies_queue));
    assert_eq!(client.replies_queue(), None);
    assert!(logs_contain("client disconnect"));
}

#[tokio::test]
async fn correlation_ids_increase_per_client() {
    let broker = MemoryBroker::new();
    let client = started_client(&broker, "void").await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let handle = client
            .send_command("noop", vec![], MessageProperties::default())
            .await
            .unwrap();
        ids.push(handle.correlation_id().to_string());
    }

    assert_eq!(ids, vec!["0", "1", "2"]);
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn replies_reach_their_own_callers() {
    let broker = MemoryBroker::new();
    let server = RpcServer::builder()
        .requests_queue("echo")
        .build(connect(&broker));
    server.add_command("echo", |args: Vec<Value>| async move {
        let delay = args[0].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok::<_, Error>(args[1].clone())
    });
    server.start().await.unwrap();
    let client = started_client(&broker, "echo").await;

    let slow = client
        .send_command("echo", vec![json!(50), json!("slow")], MessageProperties::default())
        .await
        .unwrap();
    let fast = client
        .send_command("echo", vec![json!(0), json!("fast")], MessageProperties::default())
        .await
        .unwrap();

    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(slow.unwrap(), json!("slow"));
    assert_eq!(fast.unwrap(), json!("fast"));
}

#[tokio::test]
async fn protocol_properties_override_options() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker);

    // Inspect the raw request instead of serving it
    let channel = connection.create_channel().await.unwrap();
    channel
        .assert_queue("inspect", QueueOptions::default())
        .await
        .unwrap();
    let mut consumer = channel.consume("inspect").await.unwrap();

    let client = RpcClient::builder()
        .requests_queue("inspect")
        .default_message_options(MessageProperties::new().priority(5).header("tenant", "t1"))
        .build(connection.clone())
        .unwrap();
    client.start().await.unwrap();

    let per_call = MessageProperties::new()
        .priority(1)
        .correlation_id("forged")
        .reply_to("elsewhere")
        .header("trace", "abc");
    let handle = client
        .send_command("hello", vec![json!("Alisa")], per_call)
        .await
        .unwrap();

    let delivery = match consumer.next().await {
        Some(ConsumerEvent::Delivery(delivery)) => delivery,
        other => panic!("Expected delivery, got {:?}", other),
    };
    let properties = &delivery.properties;
    assert_eq!(properties.priority, Some(5));
    assert_eq!(properties.correlation_id.as_deref(), Some(handle.correlation_id()));
    assert_eq!(properties.reply_to, client.replies_queue());
    assert_eq!(properties.headers.len(), 2);
    assert_eq!(properties.content_type.as_deref(), Some("application/json"));
    assert_eq!(
        delivery.payload,
        encode_command("hello", &[json!("Alisa")]).unwrap()
    );

    client.disconnect().await.unwrap();
    assert!(handle.await.is_err());
}

#[tokio::test]
async fn generated_reply_queue_derives_from_requests_queue() {
    let broker = MemoryBroker::new();
    let client = started_client(&broker, "greetings").await;

    let replies = client.replies_queue().unwrap();
    assert!(replies.starts_with("greetings."));
    assert!(broker.queue_exists(&replies));

    client.disconnect().await.unwrap();
    assert!(!broker.queue_exists(&replies));
}

#[tokio::test]
async fn configured_reply_queue_is_kept() {
    let broker = MemoryBroker::new();
    let _server = hello_server(&broker, "greetings").await;
    let client = RpcClient::builder()
        .requests_queue("greetings")
        .replies_queue("my-replies")
        .build(connect(&broker))
        .unwrap();
    client.start().await.unwrap();

    let reply = client.call("hello", vec![json!("Alisa")]).await.unwrap();
    assert_eq!(reply["message"], "Hello, Alisa!");

    client.disconnect().await.unwrap();
    assert!(broker.queue_exists("my-replies"));
}

#[tokio::test]
async fn client_lifecycle_errors() {
    let broker = MemoryBroker::new();

    let missing = RpcClient::builder().build(connect(&broker));
    assert!(matches!(missing, Err(Error::Configuration(_))));

    let client = RpcClient::builder()
        .requests_queue("greetings")
        .build(connect(&broker))
        .unwrap();

    // Disconnect before start is a no-op
    client.disconnect().await.unwrap();

    let err = client
        .send_command("hello", vec![], MessageProperties::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotStarted));

    client.start().await.unwrap();
    client.start().await.unwrap();
    client.disconnect().await.unwrap();

    assert!(matches!(client.start().await, Err(Error::Stopped)));
    assert!(matches!(
        client.call("hello", vec![]).await,
        Err(Error::NotStarted)
    ));
}

#[tokio::test]
async fn server_generates_and_deletes_its_queue() {
    let broker = MemoryBroker::new();
    let server = RpcServer::builder().build(connect(&broker));

    assert!(matches!(server.disconnect().await, Err(Error::NotStarted)));

    server.start().await.unwrap();
    let queue = server.requests_queue().unwrap();
    assert!(queue.starts_with("amq.gen-"));
    assert!(broker.queue_exists(&queue));

    server.disconnect().await.unwrap();
    assert!(!broker.queue_exists(&queue));
    assert_eq!(server.requests_queue(), None);
}

#[tokio::test]
async fn server_keeps_configured_queue() {
    let broker = MemoryBroker::new();
    let server = hello_server(&broker, "greetings").await;

    server.disconnect().await.unwrap();

    assert!(broker.queue_exists("greetings"));
    assert_eq!(server.requests_queue().as_deref(), Some("greetings"));
}

#[tokio::test]
async fn malformed_request_gets_error_reply() {
    let broker = MemoryBroker::new();
    let _server = hello_server(&broker, "greetings").await;

    let connection = connect(&broker);
    let channel = connection.create_channel().await.unwrap();
    channel
        .assert_queue("raw-replies", QueueOptions::exclusive(true))
        .await
        .unwrap();
    let mut replies = channel.consume("raw-replies").await.unwrap();

    let properties = MessageProperties::new()
        .reply_to("raw-replies")
        .correlation_id("x-1")
        .delivery_mode(DeliveryMode::Transient);
    channel
        .send_to_queue("greetings", b"{\"args\": []}".to_vec(), properties)
        .await
        .unwrap();

    let delivery = match replies.next().await {
        Some(ConsumerEvent::Delivery(delivery)) => delivery,
        other => panic!("Expected delivery, got {:?}", other),
    };
    assert_eq!(delivery.properties.correlation_id.as_deref(), Some("x-1"));
    assert_eq!(
        delivery.properties.delivery_mode,
        Some(DeliveryMode::Transient)
    );
    match decode_result(&delivery.payload).unwrap() {
        CommandResult::Error(remote) => assert_eq!(remote.name, "MalformedPayload"),
        other => panic!("Expected error result, got {:?}", other),
    }
}

#[tokio::test]
async fn replies_are_persistent_unless_request_is_transient() {
    let broker = MemoryBroker::new();
    let _server = hello_server(&broker, "greetings").await;

    let connection = connect(&broker);
    let channel = connection.create_channel().await.unwrap();
    channel
        .assert_queue("raw-replies", QueueOptions::exclusive(true))
        .await
        .unwrap();
    let mut replies = channel.consume("raw-replies").await.unwrap();

    let properties = MessageProperties::new()
        .reply_to("raw-replies")
        .correlation_id("p-1");
    let payload = encode_command("hello", &[json!("Alisa")]).unwrap();
    channel
        .send_to_queue("greetings", payload, properties)
        .await
        .unwrap();

    let delivery = match replies.next().await {
        Some(ConsumerEvent::Delivery(delivery)) => delivery,
        other => panic!("Expected delivery, got {:?}", other),
    };
    assert_eq!(
        delivery.properties.delivery_mode,
        Some(DeliveryMode::Persistent)
    );
    assert_eq!(
        decode_result(&delivery.payload).unwrap(),
        CommandResult::Success(json!({ "message": "Hello, Alisa!" }))
    );
}

#[tokio::test]
async fn one_off_request_helper() {
    let broker = MemoryBroker::new();
    let _server = hello_server(&broker, "greetings").await;

    let reply = request(connect(&broker), "greetings", "hello", vec![json!("Alisa")])
        .await
        .unwrap();

    assert_eq!(reply, json!({ "message": "Hello, Alisa!" }));
}

#[tokio::test]
async fn server_disconnect_releases_channel_after_broker_failure() {
    let broker = MemoryBroker::new();
    let connection = Arc::new(broker.connect());
    let server = RpcServer::builder().build(connection.clone());
    server.start().await.unwrap();
    let queue = server.requests_queue().unwrap();

    // Channel dies underneath the server
    connection.close();

    assert!(matches!(
        server.disconnect().await,
        Err(Error::Broker(BrokerError::ChannelClosed))
    ));
    assert_eq!(server.requests_queue(), None);
    assert!(!broker.queue_exists(&queue));

    // Nothing is left held: a second disconnect finds no channel and start
    // goes back to the broker
    assert!(matches!(server.disconnect().await, Err(Error::NotStarted)));
    assert!(matches!(
        server.start().await,
        Err(Error::Broker(BrokerError::ConnectionClosed))
    ));
}
