use std::future::Future;
use std::sync::Arc;

use lapin::Channel;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::info;

use super::batch_processor;
use super::connection::ConnectionSupervisor;
use super::consumer::{self, Consumer, ConsumerOptions, Listener};
use super::dispatch::{BatchProcessor, Processor};
use super::errors::{RabbitMQError, Result};
use super::instrumentation::Instrumentation;
use super::publisher::{LegacyPublisher, PublishOptions, Publisher};
use super::topology::{run_once, ChannelConfig, ExchangeType, Topology};
use crate::config::{BrokerConfig, Settings};

/// Entry point for one named broker configuration.
///
/// Consumers and publishers run on two separate supervised connections, so
/// slow consumer acknowledgements never hold up publisher confirms.
pub struct RabbitMq {
    name: String,
    consuming: ConnectionSupervisor,
    publishing: ConnectionSupervisor,
    metrics: Instrumentation,
    legacy: OnceCell<LegacyPublisher>,
}

impl RabbitMq {
    /// Starts both connections in the background. Must be called from within
    /// a tokio runtime.
    pub fn connect(name: &str, config: &BrokerConfig, metrics: Instrumentation) -> Result<Self> {
        config
            .validate()
            .map_err(|e| RabbitMQError::ConfigError(format!("{}: {:#}", name, e)))?;
        let urls = config.urls();
        let options = config.connection_options();

        let consuming = ConnectionSupervisor::connect(format!("{}-consumer", name), &urls, options.clone())?;
        let publishing = ConnectionSupervisor::connect(format!("{}-publisher", name), &urls, options)?;
        info!(
            target: "rabbitmq",
            config = name,
            hosts = ?config.hosts(),
            username = %config.username,
            "RabbitMQ client started"
        );

        Ok(Self {
            name: name.to_string(),
            consuming,
            publishing,
            metrics,
            legacy: OnceCell::new(),
        })
    }

    /// Resolves the broker block `name` from `settings` and connects.
    pub fn from_settings(settings: &Settings, name: &str, metrics: Instrumentation) -> Result<Self> {
        let config = settings
            .broker(name)
            .map_err(|e| RabbitMQError::ConfigError(format!("{:#}", e)))?;
        Self::connect(name, &config, metrics)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.metrics
    }

    pub fn consuming_connection(&self) -> &ConnectionSupervisor {
        &self.consuming
    }

    pub fn publishing_connection(&self) -> &ConnectionSupervisor {
        &self.publishing
    }

    /// Declares the input queue with its dead-letter wiring and consumes it
    /// one message at a time (up to the configured prefetch).
    pub async fn add_listener<P: Processor>(&self, config: ChannelConfig, processor: P) -> Result<Consumer> {
        let options = ConsumerOptions::from(&config);
        consumer::register(self.listener(&config, options, Arc::new(processor))).await
    }

    /// Like [`add_listener`](Self::add_listener), pulling batches of
    /// `batch_size` messages instead.
    pub async fn add_batch_listener<P: BatchProcessor>(
        &self,
        config: ChannelConfig,
        processor: P,
    ) -> Result<Consumer> {
        let options = ConsumerOptions::from(&config);
        batch_processor::register(self.listener(&config, options, Arc::new(processor))).await
    }

    /// Consumes an existing queue. Only the prefetch is set up.
    pub async fn register_consumer<P: Processor>(
        &self,
        queue: &str,
        options: ConsumerOptions,
        processor: P,
    ) -> Result<Consumer> {
        let topology = Topology::new().prefetch(options.prefetch);
        consumer::register(Listener::new(
            &self.consuming,
            &self.metrics,
            queue,
            None,
            topology,
            options,
            Arc::new(processor),
        ))
        .await
    }

    /// Pulls an existing queue in batches of `options.batch_quantity`.
    pub async fn register_batch_consumer<P: BatchProcessor>(
        &self,
        queue: &str,
        options: ConsumerOptions,
        processor: P,
    ) -> Result<Consumer> {
        let topology = Topology::new().prefetch(options.prefetch);
        batch_processor::register(Listener::new(
            &self.consuming,
            &self.metrics,
            queue,
            None,
            topology,
            options,
            Arc::new(processor),
        ))
        .await
    }

    /// Publisher bound to `exchange`, which must already exist.
    pub async fn for_exchange(&self, exchange: &str) -> Result<Publisher> {
        Publisher::for_exchange(&self.publishing, &self.metrics, exchange).await
    }

    /// Runs `setup` once on a short-lived channel. A rejected declaration is
    /// returned, not retried.
    pub async fn setup_topology<F, Fut>(&self, setup: F) -> Result<()>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        run_once(&self.consuming, setup).await
    }

    pub async fn apply_topology(&self, topology: &Topology) -> Result<()> {
        run_once(&self.consuming, |channel| async move { topology.apply(&channel).await }).await
    }

    /// Declares `exchange` on the shared publisher channel, then publishes.
    #[deprecated(note = "declare exchanges with `setup_topology` and publish through `for_exchange`")]
    pub async fn publish<T>(
        &self,
        exchange: &str,
        kind: impl Into<ExchangeType>,
        routing_key: &str,
        data: &T,
        options: PublishOptions,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let legacy = self
            .legacy
            .get_or_try_init(|| LegacyPublisher::new(&self.publishing, &self.metrics))
            .await?;
        legacy
            .publish(exchange, kind.into(), routing_key, data, options)
            .await
    }

    /// Stops reconnecting and closes both connections. Registered consumers
    /// stop receiving; publishers fail with [`RabbitMQError::Shutdown`].
    pub async fn shutdown(&self) {
        self.consuming.shutdown().await;
        self.publishing.shutdown().await;
    }

    fn listener<P: ?Sized>(&self, config: &ChannelConfig, options: ConsumerOptions, processor: Arc<P>) -> Listener<P> {
        let topology = Topology::for_consumer(config, options.prefetch);
        Listener::new(
            &self.consuming,
            &self.metrics,
            &config.input_queue,
            Some(config.binding()),
            topology,
            options,
            processor,
        )
    }
}

impl std::fmt::Debug for RabbitMq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMq")
            .field("name", &self.name)
            .field("consuming", &self.consuming)
            .field("publishing", &self.publishing)
            .finish()
    }
}
