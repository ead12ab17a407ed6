//! Exchange, queue and binding declarations.
//!
//! A [`Topology`] is a plain list of [`Declaration`]s. Building one touches no
//! broker; [`Topology::apply`] runs it on a channel. Exchanges, queues and
//! prefetch go out concurrently, bindings only after all of those succeeded.

use std::fmt;
use std::future::Future;

use futures::future::try_join_all;
use lapin::options::{BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use tracing::{debug, info};

use super::connection::ConnectionSupervisor;
use super::errors::{RabbitMQError, Result};

pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExchangeType {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
    Custom(String),
}

impl ExchangeType {
    pub fn kind(&self) -> ExchangeKind {
        match self {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Headers => ExchangeKind::Headers,
            ExchangeType::Custom(name) => ExchangeKind::Custom(name.clone()),
        }
    }
}

impl From<&str> for ExchangeType {
    fn from(name: &str) -> Self {
        match name {
            "direct" => ExchangeType::Direct,
            "fanout" => ExchangeType::Fanout,
            "topic" => ExchangeType::Topic,
            "headers" => ExchangeType::Headers,
            other => ExchangeType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeType::Direct => f.write_str("direct"),
            ExchangeType::Fanout => f.write_str("fanout"),
            ExchangeType::Topic => f.write_str("topic"),
            ExchangeType::Headers => f.write_str("headers"),
            ExchangeType::Custom(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Exchange {
        name: String,
        kind: ExchangeType,
        durable: bool,
    },
    Queue {
        name: String,
        durable: bool,
        dead_letter: Option<DeadLetter>,
    },
    Prefetch(u16),
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

impl Declaration {
    fn is_binding(&self) -> bool {
        matches!(self, Declaration::Binding { .. })
    }

    async fn apply(&self, channel: &Channel) -> Result<()> {
        match self {
            Declaration::Exchange { name, kind, durable } => {
                channel
                    .exchange_declare(
                        name,
                        kind.kind(),
                        ExchangeDeclareOptions {
                            durable: *durable,
                            ..ExchangeDeclareOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| RabbitMQError::topology(format!("exchange '{}'", name), e))?;
            }
            Declaration::Queue {
                name,
                durable,
                dead_letter,
            } => {
                channel
                    .queue_declare(
                        name,
                        QueueDeclareOptions {
                            durable: *durable,
                            ..QueueDeclareOptions::default()
                        },
                        queue_arguments(dead_letter.as_ref()),
                    )
                    .await
                    .map_err(|e| RabbitMQError::topology(format!("queue '{}'", name), e))?;
            }
            Declaration::Prefetch(count) => {
                channel
                    .basic_qos(*count, BasicQosOptions::default())
                    .await
                    .map_err(|e| RabbitMQError::topology(format!("prefetch {}", count), e))?;
            }
            Declaration::Binding {
                queue,
                exchange,
                routing_key,
            } => {
                channel
                    .queue_bind(
                        queue,
                        exchange,
                        routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| {
                        RabbitMQError::topology(
                            format!("binding '{}' -> '{}' ({})", exchange, queue, routing_key),
                            e,
                        )
                    })?;
            }
        }
        debug!(target: "rabbitmq", declaration = ?self, "Declared");
        Ok(())
    }
}

fn queue_arguments(dead_letter: Option<&DeadLetter>) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(dl) = dead_letter {
        args.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(dl.exchange.clone().into()),
        );
        args.insert(
            DEAD_LETTER_ROUTING_KEY_ARG.into(),
            AMQPValue::LongString(dl.routing_key.clone().into()),
        );
    }
    args
}

/// Declarations for one consumer: input exchange and queue, the error
/// exchange and queue, and the dead-letter wiring between them.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub input_exchange: String,
    pub input_exchange_type: ExchangeType,
    pub input_queue: String,
    pub pattern: String,
    pub error_exchange: String,
    /// Defaults to `<input_queue>_errors`.
    pub error_queue: Option<String>,
    pub prefetch: Option<u16>,
    pub batch_size: Option<usize>,
}

impl ChannelConfig {
    pub fn new(
        input_exchange: impl Into<String>,
        input_queue: impl Into<String>,
        pattern: impl Into<String>,
        error_exchange: impl Into<String>,
    ) -> Self {
        Self {
            input_exchange: input_exchange.into(),
            input_exchange_type: ExchangeType::Topic,
            input_queue: input_queue.into(),
            pattern: pattern.into(),
            error_exchange: error_exchange.into(),
            error_queue: None,
            prefetch: None,
            batch_size: None,
        }
    }

    pub fn with_exchange_type(mut self, kind: impl Into<ExchangeType>) -> Self {
        self.input_exchange_type = kind.into();
        self
    }

    pub fn with_error_queue(mut self, queue: impl Into<String>) -> Self {
        self.error_queue = Some(queue.into());
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn error_queue(&self) -> String {
        self.error_queue
            .clone()
            .unwrap_or_else(|| format!("{}_errors", self.input_queue))
    }

    /// `exchange -> pattern`, for logs.
    pub fn binding(&self) -> String {
        format!("{} -> {}", self.input_exchange, self.pattern)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    declarations: Vec<Declaration>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topology behind a consumer. Both queues are durable, and nacked input
    /// messages dead-letter to the error exchange under the input queue's name.
    pub fn for_consumer(config: &ChannelConfig, prefetch: u16) -> Self {
        let error_queue = config.error_queue();
        Topology::new()
            .exchange(&config.error_exchange, ExchangeType::Topic)
            .queue(&error_queue, None)
            .exchange(&config.input_exchange, config.input_exchange_type.clone())
            .queue(
                &config.input_queue,
                Some(DeadLetter {
                    exchange: config.error_exchange.clone(),
                    routing_key: config.input_queue.clone(),
                }),
            )
            .prefetch(prefetch)
            .bind(&config.input_queue, &config.input_exchange, &config.pattern)
            .bind(&error_queue, &config.error_exchange, &config.input_queue)
    }

    /// Durable exchange.
    pub fn exchange(mut self, name: &str, kind: ExchangeType) -> Self {
        self.declarations.push(Declaration::Exchange {
            name: name.to_string(),
            kind,
            durable: true,
        });
        self
    }

    /// Durable queue, optionally dead-lettering elsewhere.
    pub fn queue(mut self, name: &str, dead_letter: Option<DeadLetter>) -> Self {
        self.declarations.push(Declaration::Queue {
            name: name.to_string(),
            durable: true,
            dead_letter,
        });
        self
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.declarations.push(Declaration::Prefetch(count));
        self
    }

    pub fn bind(mut self, queue: &str, exchange: &str, routing_key: &str) -> Self {
        self.declarations.push(Declaration::Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        self
    }

    pub fn declare(mut self, declaration: Declaration) -> Self {
        self.declarations.push(declaration);
        self
    }

    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    /// Runs every declaration on `channel`: entities first, concurrently,
    /// then the bindings that reference them.
    pub async fn apply(&self, channel: &Channel) -> Result<()> {
        let (bindings, entities): (Vec<&Declaration>, Vec<&Declaration>) =
            self.declarations.iter().partition(|d| d.is_binding());
        try_join_all(entities.into_iter().map(|d| d.apply(channel))).await?;
        try_join_all(bindings.into_iter().map(|d| d.apply(channel))).await?;
        Ok(())
    }
}

/// Runs `setup` once on a dedicated channel of `supervisor`'s connection and
/// closes the channel afterwards. Errors from `setup` are returned unchanged.
pub async fn run_once<F, Fut>(supervisor: &ConnectionSupervisor, setup: F) -> Result<()>
where
    F: FnOnce(Channel) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let link = supervisor.link().await?;
    let channel = link
        .connection
        .create_channel()
        .await
        .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;
    let result = setup(channel.clone()).await;
    if channel.status().connected() {
        if let Err(e) = channel.close(200, "Topology setup complete").await {
            debug!(target: "rabbitmq", error = %e, "Closing topology channel failed");
        }
    }
    if result.is_ok() {
        info!(target: "rabbitmq", supervisor = supervisor.name(), "Topology set up");
    }
    result
}
