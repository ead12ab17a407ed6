// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    /// Transient link failure. The supervisor retries these on its own.
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    /// A declaration was rejected by the broker, e.g. a queue redeclared
    /// with different arguments. Never retried.
    #[error("RabbitMQ topology setup failed: {0}")]
    TopologySetupError(String),

    #[error("Message parsing failed: {0}")]
    ParsingFailure(#[source] SerdeError),

    #[error("Message processing failed: {0:#}")]
    ProcessingFailure(anyhow::Error),

    #[error("RabbitMQ broker operation failed: {0}")]
    BrokerOperationError(#[from] LapinError),

    #[error("Message serialization error: {0}")]
    SerializationError(#[source] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("RabbitMQ connection supervisor has been shut down")]
    Shutdown,
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Whether the error is expected to clear up once the link is re-established.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_) | RabbitMQError::ChannelError(_)
        )
    }

    /// A link to `host` that could not be opened or was lost.
    pub(crate) fn connection(host: &str, error: impl std::fmt::Display) -> Self {
        RabbitMQError::ConnectionError(format!("{}: {}", host, error))
    }

    /// Wraps a broker error raised while declaring topology.
    pub(crate) fn topology(what: impl std::fmt::Display, error: LapinError) -> Self {
        RabbitMQError::TopologySetupError(format!("{}: {}", what, error))
    }
}
