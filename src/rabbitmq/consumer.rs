use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures_lite::StreamExt;
use lapin::options::BasicConsumeOptions;
use lapin::types::FieldTable;
use lapin::Channel;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::channel_manager::{ChannelOptions, ChannelSetup, ManagedChannel};
use super::connection::ConnectionSupervisor;
use super::dispatch::{handle_message, Processor};
use super::errors::Result;
use super::instrumentation::Instrumentation;
use super::topology::{ChannelConfig, Topology};
use crate::message::InboundMessage;

pub const DEFAULT_PREFETCH: u16 = 1;
pub const DEFAULT_BATCH_QUANTITY: usize = 10;
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(1);

/// Consumer tuning. `prefetch` bounds the unacknowledged messages held at
/// once and is the only backpressure there is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub prefetch: u16,
    /// Messages pulled per batch (batch consumers only). Zero counts as one.
    pub batch_quantity: usize,
    /// Defaults to `<queue>-<uuid>`.
    pub consumer_tag: Option<String>,
    pub exclusive: bool,
    /// Pause between polls of an empty queue (batch consumers only).
    pub idle_interval: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
            batch_quantity: DEFAULT_BATCH_QUANTITY,
            consumer_tag: None,
            exclusive: false,
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }
}

impl ConsumerOptions {
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_batch_quantity(mut self, quantity: usize) -> Self {
        self.batch_quantity = quantity.max(1);
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub(crate) fn tag_for(&self, queue: &str) -> String {
        self.consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", queue, Uuid::new_v4().simple()))
    }
}

impl From<&ChannelConfig> for ConsumerOptions {
    fn from(config: &ChannelConfig) -> Self {
        let mut options = ConsumerOptions::default();
        if let Some(prefetch) = config.prefetch {
            options.prefetch = prefetch;
        }
        if let Some(size) = config.batch_size {
            options = options.with_batch_quantity(size);
        }
        options
    }
}

/// Handle to a registered consumer. The registration lives as long as its
/// connection supervisor; dropping the handle does not stop consumption.
#[derive(Debug, Clone)]
pub struct Consumer {
    queue: String,
    channel: Arc<ManagedChannel>,
}

impl Consumer {
    pub(crate) fn new(queue: String, channel: Arc<ManagedChannel>) -> Self {
        Self { queue, channel }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether the consumer's channel is currently open.
    pub fn is_ready(&self) -> bool {
        self.channel.is_healthy()
    }
}

/// Everything a consumer channel needs to (re)build itself.
pub(crate) struct Listener<P: ?Sized> {
    pub(crate) supervisor: ConnectionSupervisor,
    pub(crate) metrics: Instrumentation,
    pub(crate) queue: String,
    pub(crate) binding: Option<String>,
    pub(crate) topology: Topology,
    pub(crate) options: ConsumerOptions,
    pub(crate) channel_id: String,
    pub(crate) processor: Arc<P>,
}

impl<P: ?Sized> Listener<P> {
    pub(crate) fn new(
        supervisor: &ConnectionSupervisor,
        metrics: &Instrumentation,
        queue: &str,
        binding: Option<String>,
        topology: Topology,
        options: ConsumerOptions,
        processor: Arc<P>,
    ) -> Self {
        Self {
            supervisor: supervisor.clone(),
            metrics: metrics.clone(),
            queue: queue.to_string(),
            binding,
            topology,
            options,
            channel_id: ChannelOptions::consuming(queue).id,
            processor,
        }
    }

    pub(crate) fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            id: self.channel_id.clone(),
            confirm_mode: false,
        }
    }

    pub(crate) fn report_listening(&self) {
        info!(
            target: "rabbitmq",
            queue = %self.queue,
            binding = self.binding.as_deref(),
            "Listening for messages"
        );
    }
}

/// Declares the listener's topology on every (re)opened channel, then
/// starts a push consumer feeding `processor`.
pub(crate) async fn register<P>(listener: Listener<P>) -> Result<Consumer>
where
    P: Processor + ?Sized,
{
    listener.metrics.register_queue(&listener.queue);
    let consumer_tag = listener.options.tag_for(&listener.queue);
    let listener = Arc::new(listener);

    let setup: ChannelSetup = {
        let listener = listener.clone();
        Arc::new(move |channel: Channel| -> BoxFuture<'static, Result<()>> {
            let listener = listener.clone();
            let consumer_tag = consumer_tag.clone();
            Box::pin(async move {
                listener.topology.apply(&channel).await?;
                let deliveries = channel
                    .basic_consume(
                        &listener.queue,
                        &consumer_tag,
                        BasicConsumeOptions {
                            exclusive: listener.options.exclusive,
                            ..BasicConsumeOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await?;
                listener.report_listening();
                tokio::spawn(deliver(channel, deliveries, listener));
                Ok(())
            })
        })
    };

    let channel = listener
        .supervisor
        .create_channel(listener.channel_options(), setup)
        .await?;
    Ok(Consumer::new(listener.queue.clone(), channel))
}

/// Hands every delivery to its own task. Prefetch caps how many are in
/// flight. When the stream ends the channel is scheduled for recovery.
async fn deliver<P>(channel: Channel, mut deliveries: lapin::Consumer, listener: Arc<Listener<P>>)
where
    P: Processor + ?Sized,
{
    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(delivery) => {
                let message = InboundMessage::from(delivery);
                let channel = channel.clone();
                let listener = listener.clone();
                tokio::spawn(async move {
                    handle_message(
                        &channel,
                        &listener.queue,
                        &message,
                        listener.processor.as_ref(),
                        &listener.metrics,
                    )
                    .await;
                });
            }
            Err(err) => {
                error!(
                    target: "rabbitmq",
                    queue = %listener.queue,
                    error = %err,
                    "Consumer stream failed"
                );
                break;
            }
        }
    }
    debug!(target: "rabbitmq", queue = %listener.queue, "Consumer stream ended");
    listener.supervisor.recover(&listener.channel_id);
}
