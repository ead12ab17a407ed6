//! Message handling decoupled from the transport.
//!
//! Every delivery ends in exactly one settlement: an ack when processing
//! succeeded, otherwise a nack without requeue that dead-letters it. A
//! message that never reaches settlement (process crash, lost link) is
//! redelivered by the broker.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error};

use super::broker_channel::BrokerChannel;
use super::errors::RabbitMQError;
use super::instrumentation::Instrumentation;
use crate::message::{decode_payload, InboundMessage};

/// Handles one decoded message. Returning `Err` dead-letters the message.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, payload: Value, message: &InboundMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Processor for F
where
    F: Fn(Value, InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn process(&self, payload: Value, message: &InboundMessage) -> anyhow::Result<()> {
        (self)(payload, message.clone()).await
    }
}

/// Handles a decoded batch, together with the last message pulled.
#[async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    async fn process_batch(&self, payloads: Vec<Value>, last: &InboundMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> BatchProcessor for F
where
    F: Fn(Vec<Value>, InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn process_batch(&self, payloads: Vec<Value>, last: &InboundMessage) -> anyhow::Result<()> {
        (self)(payloads, last.clone()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingOutcome {
    Success,
    /// Payload was not valid JSON.
    ParsingFailed,
    /// The processor returned an error.
    ProcessingFailed,
    /// Fetching from the broker failed mid-batch.
    BrokerError,
}

impl ProcessingOutcome {
    pub const ALL: [ProcessingOutcome; 4] = [
        ProcessingOutcome::Success,
        ProcessingOutcome::ParsingFailed,
        ProcessingOutcome::ProcessingFailed,
        ProcessingOutcome::BrokerError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingOutcome::Success => "success",
            ProcessingOutcome::ParsingFailed => "parsing_failed",
            ProcessingOutcome::ProcessingFailed => "processing_failed",
            ProcessingOutcome::BrokerError => "broker_error",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            ProcessingOutcome::Success => Disposition::Ack,
            _ => Disposition::Reject,
        }
    }
}

/// What gets sent back to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// `basic.nack` with `requeue = false`: routed to the dead-letter exchange.
    Reject,
}

/// Outcome of a message. The outer result is the decode, the inner one is
/// what the processor returned.
pub fn classify<D, P>(result: &Result<Result<(), P>, D>) -> ProcessingOutcome {
    match result {
        Err(_) => ProcessingOutcome::ParsingFailed,
        Ok(Ok(())) => ProcessingOutcome::Success,
        Ok(Err(_)) => ProcessingOutcome::ProcessingFailed,
    }
}

/// Runs processor work. A panic inside it becomes an ordinary processing
/// failure so the message still gets settled.
async fn guarded<F>(work: F) -> Result<(), RabbitMQError>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result.map_err(RabbitMQError::ProcessingFailure),
        Err(panic) => Err(RabbitMQError::ProcessingFailure(anyhow::anyhow!(
            "processor panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

/// Sends the outcome's disposition for `delivery_tag` (and, with `multiple`,
/// everything before it on the channel). Broker failures are logged; the
/// broker redelivers whatever stays unsettled.
pub async fn settle<C>(channel: &C, queue: &str, delivery_tag: u64, multiple: bool, outcome: ProcessingOutcome)
where
    C: BrokerChannel + ?Sized,
{
    let result = match outcome.disposition() {
        Disposition::Ack => channel.ack(delivery_tag, multiple).await,
        Disposition::Reject => channel.nack(delivery_tag, multiple).await,
    };
    if let Err(err) = result {
        error!(
            target: "rabbitmq",
            queue,
            delivery_tag,
            multiple,
            outcome = outcome.as_str(),
            error = %err,
            "Failed to settle message"
        );
    }
}

/// Decodes, processes and settles a single pushed delivery.
pub async fn handle_message<C, P>(
    channel: &C,
    queue: &str,
    message: &InboundMessage,
    processor: &P,
    metrics: &Instrumentation,
) -> ProcessingOutcome
where
    C: BrokerChannel + ?Sized,
    P: Processor + ?Sized,
{
    metrics.message_received(queue, message.timestamp());
    let started = Instant::now();

    let result = match decode_payload(&message.data) {
        Err(err) => {
            let err = RabbitMQError::ParsingFailure(err);
            error!(
                target: "rabbitmq",
                queue,
                routing_key = %message.routing_key,
                delivery_tag = message.delivery_tag,
                payload = %message.payload_lossy(),
                error = %err,
                "RabbitMQ event processing failed"
            );
            Err(err)
        }
        Ok(payload) => {
            let processed = guarded(processor.process(payload.clone(), message)).await;
            if let Err(err) = &processed {
                error!(
                    target: "rabbitmq",
                    queue,
                    routing_key = %message.routing_key,
                    delivery_tag = message.delivery_tag,
                    content = %payload,
                    error = %err,
                    "RabbitMQ event processing failed"
                );
            }
            Ok(processed)
        }
    };
    let outcome = classify(&result);

    settle(channel, queue, message.delivery_tag, false, outcome).await;
    metrics.messages_settled(queue, outcome, 1, started.elapsed());
    debug!(
        target: "rabbitmq",
        queue,
        delivery_tag = message.delivery_tag,
        outcome = outcome.as_str(),
        "Message settled"
    );
    outcome
}

/// Upper bound on the buffer reserved up front for a batch.
const MAX_PREALLOCATED: usize = 1024;

/// Pulls up to `batch_quantity` messages and handles them as one unit.
///
/// The batch is settled with a single cumulative ack or nack on the last
/// pulled message, so one bad payload dead-letters the whole batch. A
/// quantity of zero is treated as one. Returns `None` when the queue was
/// empty and nothing happened.
pub async fn handle_batch<C, P>(
    channel: &C,
    queue: &str,
    batch_quantity: usize,
    processor: &P,
    metrics: &Instrumentation,
) -> Option<ProcessingOutcome>
where
    C: BrokerChannel + ?Sized,
    P: BatchProcessor + ?Sized,
{
    let batch_quantity = batch_quantity.max(1);
    let mut pulled: Vec<InboundMessage> = Vec::with_capacity(batch_quantity.min(MAX_PREALLOCATED));
    let mut pull_error = None;
    while pulled.len() < batch_quantity {
        match channel.get(queue).await {
            Ok(Some(message)) => {
                metrics.message_received(queue, message.timestamp());
                pulled.push(message);
            }
            Ok(None) => break,
            Err(err) => {
                pull_error = Some(err);
                break;
            }
        }
    }

    let started = Instant::now();
    let Some(last) = pulled.last() else {
        if let Some(err) = pull_error {
            error!(target: "rabbitmq", queue, error = %err, "RabbitMQ batch fetch failed");
            return Some(ProcessingOutcome::BrokerError);
        }
        return None;
    };

    let outcome = if let Some(err) = pull_error {
        error!(
            target: "rabbitmq",
            queue,
            pulled = pulled.len(),
            error = %err,
            "RabbitMQ batch fetch failed"
        );
        ProcessingOutcome::BrokerError
    } else {
        match pulled
            .iter()
            .map(|m| decode_payload(&m.data))
            .collect::<Result<Vec<Value>, _>>()
        {
            Err(err) => {
                let err = RabbitMQError::ParsingFailure(err);
                let payloads: Vec<_> = pulled.iter().map(|m| m.payload_lossy()).collect();
                error!(
                    target: "rabbitmq",
                    queue,
                    batch_size = pulled.len(),
                    payloads = ?payloads,
                    error = %err,
                    "RabbitMQ batch processing failed"
                );
                ProcessingOutcome::ParsingFailed
            }
            Ok(payloads) => match guarded(processor.process_batch(payloads, last)).await {
                Ok(()) => ProcessingOutcome::Success,
                Err(err) => {
                    error!(
                        target: "rabbitmq",
                        queue,
                        batch_size = pulled.len(),
                        last_delivery_tag = last.delivery_tag,
                        error = %err,
                        "RabbitMQ batch processing failed"
                    );
                    ProcessingOutcome::ProcessingFailed
                }
            },
        }
    };

    settle(channel, queue, last.delivery_tag, true, outcome).await;
    metrics.messages_settled(queue, outcome, pulled.len() as u64, started.elapsed());
    debug!(
        target: "rabbitmq",
        queue,
        batch_size = pulled.len(),
        outcome = outcome.as_str(),
        "Batch settled"
    );
    Some(outcome)
}
