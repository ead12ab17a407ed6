// src/rabbitmq/mod.rs
// Supervised connections, consumers and confirmed publishing

pub mod errors;
pub mod connection;
pub mod channel_manager;
pub mod topology;
pub mod dispatch;
pub mod instrumentation;
pub mod consumer;
pub mod publisher;
pub mod client;

// Private implementation details
mod broker_channel;
mod batch_processor;

// Re-export specific items to simplify imports elsewhere
pub use broker_channel::BrokerChannel;
pub use client::RabbitMq;
pub use connection::{ConnectionOptions, ConnectionSupervisor, Endpoint};
pub use consumer::{Consumer, ConsumerOptions};
pub use dispatch::{BatchProcessor, Disposition, ProcessingOutcome, Processor};
pub use errors::{RabbitMQError, Result};
pub use instrumentation::{Instrumentation, PublishOutcome};
pub use publisher::{MessageProperties, PublishOptions, Publisher};
pub use topology::{ChannelConfig, Declaration, DeadLetter, ExchangeType, Topology};
