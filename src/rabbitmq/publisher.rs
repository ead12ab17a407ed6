use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel};
use serde::Serialize;
use tracing::{debug, error};

use super::channel_manager::{ChannelOptions, ChannelSetup, ManagedChannel};
use super::connection::ConnectionSupervisor;
use super::errors::{RabbitMQError, Result};
use super::instrumentation::{Instrumentation, PublishOutcome};
use super::topology::{ExchangeType, Topology};
use crate::message::encode_payload;

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

/// Per-message overrides. Unset fields keep the [`MessageProperties`] defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub content_type: Option<String>,
    pub persistent: Option<bool>,
    pub timestamp: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Per-message TTL.
    pub expiration: Option<Duration>,
    pub priority: Option<u8>,
    /// Added to (and replacing same-named) default headers.
    pub headers: BTreeMap<String, String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Properties a message is actually sent with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
    pub persistent: bool,
    pub timestamp: DateTime<Utc>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub expiration: Option<Duration>,
    pub priority: Option<u8>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// JSON, persistent, stamped with `now`.
    pub fn defaults_at(now: DateTime<Utc>) -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            persistent: true,
            timestamp: now,
            message_id: None,
            correlation_id: None,
            expiration: None,
            priority: None,
            headers: BTreeMap::new(),
        }
    }

    /// Applies every field the caller set.
    pub fn override_with(mut self, options: PublishOptions) -> Self {
        if let Some(content_type) = options.content_type {
            self.content_type = content_type;
        }
        if let Some(persistent) = options.persistent {
            self.persistent = persistent;
        }
        if let Some(timestamp) = options.timestamp {
            self.timestamp = timestamp;
        }
        self.message_id = options.message_id.or(self.message_id);
        self.correlation_id = options.correlation_id.or(self.correlation_id);
        self.expiration = options.expiration.or(self.expiration);
        self.priority = options.priority.or(self.priority);
        self.headers.extend(options.headers);
        self
    }

    pub fn to_basic_properties(&self) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(self.content_type.as_str()))
            .with_delivery_mode(if self.persistent { PERSISTENT } else { TRANSIENT })
            .with_timestamp(u64::try_from(self.timestamp.timestamp()).unwrap_or_default());
        if let Some(id) = &self.message_id {
            properties = properties.with_message_id(ShortString::from(id.as_str()));
        }
        if let Some(id) = &self.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id.as_str()));
        }
        if let Some(ttl) = self.expiration {
            properties = properties.with_expiration(ShortString::from(ttl.as_millis().to_string()));
        }
        if let Some(priority) = self.priority {
            properties = properties.with_priority(priority);
        }
        if !self.headers.is_empty() {
            let mut headers = FieldTable::default();
            for (name, value) in &self.headers {
                headers.insert(
                    ShortString::from(name.as_str()),
                    AMQPValue::LongString(LongString::from(value.as_str())),
                );
            }
            properties = properties.with_headers(headers);
        }
        properties
    }
}

/// Publishes and waits for the broker's confirm. A negative confirm is an
/// error like any transport failure.
pub(crate) async fn send_confirmed(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
    properties: BasicProperties,
) -> Result<()> {
    let confirmation = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            body,
            properties,
        )
        .await?
        .await?;
    if confirmation.is_nack() {
        return Err(RabbitMQError::PublishError(format!(
            "Broker did not confirm message to {} with routing key {}",
            exchange, routing_key
        )));
    }
    Ok(())
}

/// Serializes, sends with confirms and records the outcome. Errors are
/// logged and returned.
async fn publish_on<T>(
    supervisor: &ConnectionSupervisor,
    managed: &ManagedChannel,
    metrics: &Instrumentation,
    exchange: &str,
    routing_key: &str,
    data: &T,
    options: PublishOptions,
) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let result = match encode_payload(data) {
        Ok(body) => {
            let properties = MessageProperties::defaults_at(Utc::now())
                .override_with(options)
                .to_basic_properties();
            match supervisor.channel(managed).await {
                Ok(channel) => send_confirmed(&channel, exchange, routing_key, &body, properties)
                    .await
                    .map(|()| body),
                Err(err) => Err(err),
            }
        }
        Err(err) => Err(RabbitMQError::SerializationError(err)),
    };

    match result {
        Ok(body) => {
            metrics.message_published(exchange, PublishOutcome::Success);
            debug!(
                target: "rabbitmq",
                exchange,
                routing_key,
                body = %String::from_utf8_lossy(&body),
                "RabbitMQ message published"
            );
            Ok(())
        }
        Err(err) => {
            metrics.message_published(exchange, PublishOutcome::Failure);
            error!(
                target: "rabbitmq",
                exchange,
                routing_key,
                body = %serde_json::to_string(data).unwrap_or_default(),
                error = %err,
                "RabbitMQ message publishing failed"
            );
            Err(err)
        }
    }
}

/// Publishes to one exchange over a confirm-mode channel of the publishing
/// connection. Cheap to clone.
#[derive(Clone)]
pub struct Publisher {
    exchange: String,
    supervisor: ConnectionSupervisor,
    channel: Arc<ManagedChannel>,
    metrics: Instrumentation,
}

impl Publisher {
    /// Opens the channel after checking that `exchange` exists. The exchange
    /// is never declared here.
    pub(crate) async fn for_exchange(
        supervisor: &ConnectionSupervisor,
        metrics: &Instrumentation,
        exchange: &str,
    ) -> Result<Self> {
        metrics.register_exchange(exchange);

        let name = exchange.to_string();
        let setup: ChannelSetup = Arc::new(move |channel: Channel| -> BoxFuture<'static, Result<()>> {
            let name = name.clone();
            Box::pin(async move {
                channel
                    .exchange_declare(
                        &name,
                        ExchangeType::Topic.kind(),
                        ExchangeDeclareOptions {
                            passive: true,
                            ..ExchangeDeclareOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| RabbitMQError::topology(format!("exchange {} check", name), e))
            })
        });

        match supervisor
            .create_channel(ChannelOptions::publishing(exchange), setup)
            .await
        {
            Ok(channel) => Ok(Self {
                exchange: exchange.to_string(),
                supervisor: supervisor.clone(),
                channel,
                metrics: metrics.clone(),
            }),
            Err(err) => {
                metrics.message_published(exchange, PublishOutcome::Failure);
                error!(
                    target: "rabbitmq",
                    exchange,
                    error = %err,
                    "RabbitMQ exchange check failed"
                );
                Err(err)
            }
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Sends `data` as JSON and resolves once the broker confirmed it.
    pub async fn publish<T>(&self, routing_key: &str, data: &T, options: PublishOptions) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        publish_on(
            &self.supervisor,
            &self.channel,
            &self.metrics,
            &self.exchange,
            routing_key,
            data,
            options,
        )
        .await
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("exchange", &self.exchange)
            .field("channel", &self.channel)
            .finish()
    }
}

/// The single shared channel behind the exchange-declaring `publish`. Every
/// exchange it has seen is declared again whenever the channel reopens.
pub(crate) struct LegacyPublisher {
    supervisor: ConnectionSupervisor,
    channel: Arc<ManagedChannel>,
    exchanges: Arc<Mutex<BTreeMap<String, ExchangeType>>>,
    metrics: Instrumentation,
}

impl LegacyPublisher {
    pub(crate) async fn new(supervisor: &ConnectionSupervisor, metrics: &Instrumentation) -> Result<Self> {
        let exchanges: Arc<Mutex<BTreeMap<String, ExchangeType>>> = Arc::default();
        let setup: ChannelSetup = {
            let exchanges = exchanges.clone();
            Arc::new(move |channel: Channel| -> BoxFuture<'static, Result<()>> {
                let topology = declared(&exchanges);
                Box::pin(async move { topology.apply(&channel).await })
            })
        };
        let channel = supervisor
            .create_channel(ChannelOptions::publishing("shared"), setup)
            .await?;
        Ok(Self {
            supervisor: supervisor.clone(),
            channel,
            exchanges,
            metrics: metrics.clone(),
        })
    }

    pub(crate) async fn publish<T>(
        &self,
        exchange: &str,
        kind: ExchangeType,
        routing_key: &str,
        data: &T,
        options: PublishOptions,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let previous = self
            .exchanges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(exchange.to_string(), kind.clone());
        if previous.is_none() {
            self.metrics.register_exchange(exchange);
        }

        let declared = match self.supervisor.channel(&self.channel).await {
            Ok(channel) => Topology::new().exchange(exchange, kind).apply(&channel).await,
            Err(err) => Err(err),
        };
        if let Err(err) = declared {
            forget_rejected(&self.exchanges, exchange, previous);
            self.metrics.message_published(exchange, PublishOutcome::Failure);
            error!(
                target: "rabbitmq",
                exchange,
                routing_key,
                error = %err,
                "RabbitMQ message publishing failed"
            );
            return Err(err);
        }

        publish_on(
            &self.supervisor,
            &self.channel,
            &self.metrics,
            exchange,
            routing_key,
            data,
            options,
        )
        .await
    }
}

/// Undoes a declaration the broker rejected. An exchange that was already
/// declared keeps the kind it was declared with.
fn forget_rejected(
    exchanges: &Mutex<BTreeMap<String, ExchangeType>>,
    exchange: &str,
    previous: Option<ExchangeType>,
) {
    let mut exchanges = exchanges.lock().unwrap_or_else(PoisonError::into_inner);
    match previous {
        Some(kind) => {
            exchanges.insert(exchange.to_string(), kind);
        }
        None => {
            exchanges.remove(exchange);
        }
    }
}

fn declared(exchanges: &Mutex<BTreeMap<String, ExchangeType>>) -> Topology {
    exchanges
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .fold(Topology::new(), |topology, (name, kind)| {
            topology.exchange(name, kind.clone())
        })
}
