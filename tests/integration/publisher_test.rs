use lapin::options::{ExchangeDeclareOptions, ExchangeDeleteOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use rabbit_core::rabbitmq::instrumentation::OUTGOING_MESSAGES;
use rabbit_core::rabbitmq::{Declaration, ExchangeType, Instrumentation, PublishOptions, RabbitMQError, Topology};
use serde_json::json;

use crate::common::{client, raw_channel, sample, take, unique};

#[tokio::test]
#[ignore] // requires a running RabbitMQ instance
async fn test_publisher_requires_existing_exchange() {
    let (metrics, handle) = Instrumentation::prometheus().unwrap();
    let client = client(metrics);
    let exchange = unique("missing");

    let err = client.for_exchange(&exchange).await.unwrap_err();
    assert!(matches!(err, RabbitMQError::TopologySetupError(_)), "{:?}", err);
    assert_eq!(
        sample(&handle.render(), OUTGOING_MESSAGES, &[("exchange", exchange.as_str()), ("outcome", "failure")]),
        Some(1.0)
    );

    client.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_publish_waits_for_confirm() {
    let (metrics, handle) = Instrumentation::prometheus().unwrap();
    let client = client(metrics);
    let exchange = unique("orders");
    let queue = unique("orders_audit");
    client
        .apply_topology(
            &Topology::new()
                .exchange(&exchange, ExchangeType::Topic)
                .queue(&queue, None)
                .bind(&queue, &exchange, "orders.#"),
        )
        .await
        .unwrap();

    let publisher = client.for_exchange(&exchange).await.unwrap();
    assert_eq!(
        sample(&handle.render(), OUTGOING_MESSAGES, &[("exchange", exchange.as_str()), ("outcome", "success")]),
        Some(0.0)
    );
    publisher
        .publish(
            "orders.created",
            &json!({"id": 7}),
            PublishOptions::new().with_message_id("order-7").with_header("source", "test"),
        )
        .await
        .unwrap();

    assert_eq!(
        sample(&handle.render(), OUTGOING_MESSAGES, &[("exchange", exchange.as_str()), ("outcome", "success")]),
        Some(1.0)
    );
    let raw = raw_channel(&client).await;
    let body = take(&raw, &queue).await.expect("routed");
    assert_eq!(serde_json::from_slice::<serde_json::Value>(&body).unwrap(), json!({"id": 7}));

    client.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_publish_to_deleted_exchange_fails_and_counts() {
    let (metrics, handle) = Instrumentation::prometheus().unwrap();
    let client = client(metrics);
    let exchange = unique("orders");
    client
        .apply_topology(&Topology::new().exchange(&exchange, ExchangeType::Topic))
        .await
        .unwrap();
    let publisher = client.for_exchange(&exchange).await.unwrap();

    let raw = raw_channel(&client).await;
    raw.exchange_delete(&exchange, ExchangeDeleteOptions::default())
        .await
        .unwrap();

    let result = publisher
        .publish("orders.created", &json!({"id": 1}), PublishOptions::new())
        .await;
    assert!(result.is_err());
    assert_eq!(
        sample(&handle.render(), OUTGOING_MESSAGES, &[("exchange", exchange.as_str()), ("outcome", "failure")]),
        Some(1.0)
    );

    client.shutdown().await;
}

#[tokio::test]
#[ignore]
#[allow(deprecated)]
async fn test_legacy_publish_declares_exchange() {
    let client = client(Instrumentation::noop());
    let exchange = unique("legacy");

    client
        .publish(&exchange, "fanout", "", &json!({"id": 9}), PublishOptions::new())
        .await
        .unwrap();

    let raw = raw_channel(&client).await;
    raw.exchange_declare(
        &exchange,
        ExchangeType::Fanout.kind(),
        ExchangeDeclareOptions {
            passive: true,
            ..ExchangeDeclareOptions::default()
        },
        FieldTable::default(),
    )
    .await
    .unwrap();

    client.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn test_conflicting_redeclaration_is_rejected() {
    let client = client(Instrumentation::noop());
    let queue = unique("conflict");

    client
        .setup_topology(|channel| {
            let queue = queue.clone();
            async move {
                channel
                    .queue_declare(
                        &queue,
                        QueueDeclareOptions {
                            durable: true,
                            ..QueueDeclareOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await?;
                Ok::<(), RabbitMQError>(())
            }
        })
        .await
        .unwrap();

    let err = client
        .apply_topology(&Topology::new().declare(Declaration::Queue {
            name: queue.clone(),
            durable: false,
            dead_letter: None,
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::TopologySetupError(_)), "{:?}", err);

    client.shutdown().await;
}
