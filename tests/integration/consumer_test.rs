use std::sync::{Arc, Mutex};
use std::time::Duration;

use rabbit_core::rabbitmq::instrumentation::{INCOMING_MESSAGES, PROCESSED_MESSAGES};
use rabbit_core::rabbitmq::{ChannelConfig, Instrumentation, PublishOptions, Topology};
use rabbit_core::InboundMessage;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use crate::common::{client, eventually, publish_raw, raw_channel, sample, take, unique, TIMEOUT};

struct Names {
    exchange: String,
    queue: String,
    error_exchange: String,
}

impl Names {
    fn new() -> Self {
        Self {
            exchange: unique("orders"),
            queue: unique("orders_created"),
            error_exchange: unique("orders_errors"),
        }
    }

    fn config(&self) -> ChannelConfig {
        ChannelConfig::new(&self.exchange, &self.queue, "orders.created", &self.error_exchange)
    }

    fn error_queue(&self) -> String {
        format!("{}_errors", self.queue)
    }
}

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_published_order_is_processed_and_acked() {
    let (metrics, handle) = Instrumentation::prometheus().unwrap();
    let client = client(metrics);
    let names = Names::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = client
        .add_listener(names.config(), move |payload: Value, _message: InboundMessage| {
            let tx = tx.clone();
            async move {
                tx.send(payload)?;
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
        .unwrap();
    assert!(consumer.is_ready());
    assert_eq!(consumer.queue(), names.queue);

    let publisher = client.for_exchange(&names.exchange).await.unwrap();
    publisher
        .publish("orders.created", &json!({"id": 1}), PublishOptions::new())
        .await
        .unwrap();

    let received = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, json!({"id": 1}));

    assert!(
        eventually(|| {
            sample(
                &handle.render(),
                PROCESSED_MESSAGES,
                &[("queue", names.queue.as_str()), ("outcome", "success")],
            ) == Some(1.0)
        })
        .await
    );
    assert_eq!(
        sample(&handle.render(), INCOMING_MESSAGES, &[("queue", names.queue.as_str())]),
        Some(1.0)
    );

    let raw = raw_channel(&client).await;
    let declared = raw
        .queue_declare(
            &names.error_queue(),
            lapin::options::QueueDeclareOptions {
                passive: true,
                ..Default::default()
            },
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(declared.message_count(), 0);

    client.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_non_json_payload_is_dead_lettered() {
    let (metrics, handle) = Instrumentation::prometheus().unwrap();
    let client = client(metrics);
    let names = Names::new();

    let calls = Arc::new(Mutex::new(0usize));
    let counted = calls.clone();
    client
        .add_listener(names.config(), move |_payload: Value, _message: InboundMessage| {
            let counted = counted.clone();
            async move {
                *counted.lock().unwrap() += 1;
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
        .unwrap();

    let raw = raw_channel(&client).await;
    publish_raw(&raw, &names.queue, b"not json {").await;

    let dead = take(&raw, &names.error_queue()).await.expect("dead-lettered");
    assert_eq!(dead, b"not json {");
    assert_eq!(*calls.lock().unwrap(), 0);
    assert_eq!(
        sample(
            &handle.render(),
            PROCESSED_MESSAGES,
            &[("queue", names.queue.as_str()), ("outcome", "parsing_failed")],
        ),
        Some(1.0)
    );
    assert_eq!(
        sample(&handle.render(), INCOMING_MESSAGES, &[("queue", names.queue.as_str())]),
        Some(1.0)
    );

    client.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_failing_processor_dead_letters_without_requeue() {
    let (metrics, handle) = Instrumentation::prometheus().unwrap();
    let client = client(metrics);
    let names = Names::new();

    client
        .add_listener(names.config(), |_payload: Value, _message: InboundMessage| async {
            Err::<(), _>(anyhow::anyhow!("payment service unavailable"))
        })
        .await
        .unwrap();

    let raw = raw_channel(&client).await;
    publish_raw(&raw, &names.queue, br#"{"id":2}"#).await;

    let dead = take(&raw, &names.error_queue()).await.expect("dead-lettered");
    assert_eq!(dead, br#"{"id":2}"#);
    assert!(
        eventually(|| {
            sample(
                &handle.render(),
                PROCESSED_MESSAGES,
                &[("queue", names.queue.as_str()), ("outcome", "processing_failed")],
            ) == Some(1.0)
        })
        .await
    );
    // nothing requeued to the input queue
    assert!(tokio::time::timeout(Duration::from_secs(1), take(&raw, &names.queue))
        .await
        .map_or(true, |message| message.is_none()));

    client.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_batch_listener_takes_what_is_ready() {
    let client = client(Instrumentation::noop());
    let names = Names::new();
    let config = names.config().with_batch_size(10);
    client
        .apply_topology(&Topology::for_consumer(&config, 1))
        .await
        .unwrap();

    let raw = raw_channel(&client).await;
    for id in 0..3 {
        publish_raw(&raw, &names.queue, json!({ "id": id }).to_string().as_bytes()).await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .add_batch_listener(config, move |payloads: Vec<Value>, _last: InboundMessage| {
            let tx = tx.clone();
            async move {
                tx.send(payloads)?;
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
        .unwrap();

    let batch = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(batch, vec![json!({"id": 0}), json!({"id": 1}), json!({"id": 2})]);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let declared = raw
        .queue_declare(
            &names.queue,
            lapin::options::QueueDeclareOptions {
                passive: true,
                ..Default::default()
            },
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(declared.message_count(), 0);

    client.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_listener_resumes_after_reconnect() {
    let client = client(Instrumentation::noop());
    let names = Names::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = client
        .add_listener(names.config(), move |payload: Value, _message: InboundMessage| {
            let tx = tx.clone();
            async move {
                tx.send(payload)?;
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
        .unwrap();

    let first = client.consuming_connection().link().await.unwrap();
    first.connection.close(320, "Connection forced by test").await.unwrap();
    assert!(eventually(|| !consumer.is_ready()).await);
    assert!(eventually(|| consumer.is_ready()).await);

    let publisher = client.for_exchange(&names.exchange).await.unwrap();
    publisher
        .publish("orders.created", &json!({"id": 3}), PublishOptions::new())
        .await
        .unwrap();

    let received = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, json!({"id": 3}));

    client.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_in_flight_message_is_redelivered_after_reconnect() {
    let client = client(Instrumentation::noop());
    let names = Names::new();

    // the first delivery is held until after the connection drops
    let release = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = client
        .add_listener(names.config(), {
            let release = release.clone();
            move |payload: Value, message: InboundMessage| {
                let release = release.clone();
                let tx = tx.clone();
                async move {
                    tx.send((payload, message.redelivered))?;
                    if !message.redelivered {
                        release.notified().await;
                    }
                    Ok::<(), anyhow::Error>(())
                }
            }
        })
        .await
        .unwrap();

    let raw = raw_channel(&client).await;
    publish_raw(&raw, &names.queue, br#"{"id":4}"#).await;
    let first = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, (json!({"id": 4}), false));

    let link = client.consuming_connection().link().await.unwrap();
    link.connection.close(320, "Connection forced by test").await.unwrap();
    assert!(eventually(|| !consumer.is_ready()).await);

    let second = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(second, (json!({"id": 4}), true));
    // the stale ack goes to a dead channel
    release.notify_one();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(rx.try_recv().is_err(), "delivered more than twice");

    let raw = raw_channel(&client).await;
    for (queue, what) in [(names.queue.clone(), "input"), (names.error_queue(), "error")] {
        let declared = raw
            .queue_declare(
                &queue,
                lapin::options::QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(declared.message_count(), 0, "{} queue not empty", what);
    }

    client.shutdown().await;
}
