//! Broker metrics: inbound counts, queue wait and processing latency per
//! queue, outbound counts per exchange.
//!
//! `Instrumentation` registers its series against an explicit
//! [`metrics::Recorder`] instead of the global one, so every test can hand in
//! a fresh registry.

use std::sync::Arc;
use std::time::Duration;

use metrics::{Key, Label, Level, Metadata, NoopRecorder, Recorder, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use super::dispatch::ProcessingOutcome;
use super::errors::{RabbitMQError, Result};

pub const INCOMING_MESSAGES: &str = "rabbitmq_incoming_messages_total";
pub const PROCESSED_MESSAGES: &str = "rabbitmq_processed_messages_total";
pub const QUEUE_WAIT_SECONDS: &str = "rabbitmq_queue_wait_seconds";
pub const PROCESSING_SECONDS: &str = "rabbitmq_processing_duration_seconds";
pub const OUTGOING_MESSAGES: &str = "rabbitmq_outgoing_messages_total";

pub const QUEUE_WAIT_BUCKETS: [f64; 12] = [
    0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 360.0, 600.0, 1800.0,
];
pub const PROCESSING_BUCKETS: [f64; 10] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

/// Result of a publish, as labelled on the outgoing counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Success,
    Failure,
}

impl PublishOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishOutcome::Success => "success",
            PublishOutcome::Failure => "failure",
        }
    }
}

#[derive(Clone)]
pub struct Instrumentation {
    recorder: Arc<dyn Recorder + Send + Sync>,
}

impl Instrumentation {
    pub fn new(recorder: Arc<dyn Recorder + Send + Sync>) -> Self {
        recorder.describe_counter(
            INCOMING_MESSAGES.into(),
            Some(Unit::Count),
            "Messages delivered to a consumer, per queue".into(),
        );
        recorder.describe_counter(
            PROCESSED_MESSAGES.into(),
            Some(Unit::Count),
            "Messages settled by a consumer, per queue and outcome".into(),
        );
        recorder.describe_histogram(
            QUEUE_WAIT_SECONDS.into(),
            Some(Unit::Seconds),
            "Time between publish and delivery".into(),
        );
        recorder.describe_histogram(
            PROCESSING_SECONDS.into(),
            Some(Unit::Seconds),
            "Time spent decoding, processing and settling a message or batch".into(),
        );
        recorder.describe_counter(
            OUTGOING_MESSAGES.into(),
            Some(Unit::Count),
            "Publish attempts, per exchange and outcome".into(),
        );
        Self { recorder }
    }

    /// Instrumentation backed by a Prometheus registry with the broker
    /// histogram buckets. The handle renders the exposition text.
    pub fn prometheus() -> Result<(Self, PrometheusHandle)> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full(QUEUE_WAIT_SECONDS.to_string()),
                &QUEUE_WAIT_BUCKETS,
            )
            .and_then(|b| {
                b.set_buckets_for_metric(
                    Matcher::Full(PROCESSING_SECONDS.to_string()),
                    &PROCESSING_BUCKETS,
                )
            })
            .map_err(|e| RabbitMQError::ConfigError(e.to_string()))?
            .build_recorder();
        let handle = recorder.handle();
        Ok((Self::new(Arc::new(recorder)), handle))
    }

    /// Instrumentation that drops everything.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopRecorder))
    }

    /// Creates the queue's counters at zero so idle queues still report.
    pub fn register_queue(&self, queue: &str) {
        self.counter(INCOMING_MESSAGES, vec![Label::new("queue", queue.to_string())])
            .increment(0);
        for outcome in ProcessingOutcome::ALL {
            self.counter(PROCESSED_MESSAGES, outcome_labels(queue, outcome))
                .increment(0);
        }
    }

    pub fn register_exchange(&self, exchange: &str) {
        for outcome in [PublishOutcome::Success, PublishOutcome::Failure] {
            self.counter(OUTGOING_MESSAGES, exchange_labels(exchange, outcome))
                .increment(0);
        }
    }

    /// Counts an arrival and observes how long it sat in the queue.
    pub fn message_received(&self, queue: &str, published_at: Option<u64>) {
        self.counter(INCOMING_MESSAGES, vec![Label::new("queue", queue.to_string())])
            .increment(1);
        if let Some(wait) = published_at.and_then(queue_wait) {
            self.histogram(QUEUE_WAIT_SECONDS, vec![Label::new("queue", queue.to_string())])
                .record(wait.as_secs_f64());
        }
    }

    /// Records the outcome of `count` messages settled together, and the
    /// time taken to handle them.
    pub fn messages_settled(
        &self,
        queue: &str,
        outcome: ProcessingOutcome,
        count: u64,
        elapsed: Duration,
    ) {
        self.counter(PROCESSED_MESSAGES, outcome_labels(queue, outcome))
            .increment(count);
        self.histogram(PROCESSING_SECONDS, outcome_labels(queue, outcome))
            .record(elapsed.as_secs_f64());
    }

    pub fn message_published(&self, exchange: &str, outcome: PublishOutcome) {
        self.counter(OUTGOING_MESSAGES, exchange_labels(exchange, outcome))
            .increment(1);
    }

    fn counter(&self, name: &'static str, labels: Vec<Label>) -> metrics::Counter {
        self.recorder
            .register_counter(&Key::from_parts(name, labels), &metadata())
    }

    fn histogram(&self, name: &'static str, labels: Vec<Label>) -> metrics::Histogram {
        self.recorder
            .register_histogram(&Key::from_parts(name, labels), &metadata())
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation").finish_non_exhaustive()
    }
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

fn outcome_labels(queue: &str, outcome: ProcessingOutcome) -> Vec<Label> {
    vec![
        Label::new("queue", queue.to_string()),
        Label::new("outcome", outcome.as_str()),
    ]
}

fn exchange_labels(exchange: &str, outcome: PublishOutcome) -> Vec<Label> {
    vec![
        Label::new("exchange", exchange.to_string()),
        Label::new("outcome", outcome.as_str()),
    ]
}

/// Wait time from an AMQP timestamp (seconds). Clock skew that would make it
/// negative is clamped to zero.
fn queue_wait(published_at: u64) -> Option<Duration> {
    let now_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).ok()?;
    Some(Duration::from_millis(
        now_ms.saturating_sub(published_at.saturating_mul(1000)),
    ))
}
