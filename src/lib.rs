//! RabbitMQ consumers and publishers that survive broker restarts.
//!
//! A [`RabbitMq`] client owns two supervised connections, one for consuming
//! and one for publishing. Listeners declare their queue together with a
//! durable `<queue>_errors` dead-letter queue; a message whose payload is not
//! JSON, or whose processor fails, is nacked without requeue and lands there.
//! Publishers wait for broker confirms before returning.

pub mod config;
pub mod env;
pub mod logging;
pub mod message;
pub mod rabbitmq;

pub use config::{BrokerConfig, Settings};
pub use logging::{init_tracing, LogSettings};
pub use message::InboundMessage;
pub use rabbitmq::{
    ChannelConfig, ConsumerOptions, ExchangeType, Instrumentation, ProcessingOutcome, PublishOptions,
    Publisher, RabbitMQError, RabbitMq, Result,
};
