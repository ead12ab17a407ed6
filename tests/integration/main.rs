// Broker-backed tests. They need a running RabbitMQ and are ignored by
// default: cargo test --test integration -- --ignored
//
// The broker comes from RABBITMQ_URI, else from
// tests/fixtures/rabbitmq/configs/test_config.json.

mod common;
mod connection_test;
mod consumer_test;
mod publisher_test;
