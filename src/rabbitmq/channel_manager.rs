use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use lapin::options::ConfirmSelectOptions;
use lapin::Channel;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::Link;
use super::errors::{RabbitMQError, Result};

/// Declarations (and consumer registration) run on every freshly opened
/// channel. Must be idempotent: it runs again after each reconnect.
pub type ChannelSetup = Arc<dyn Fn(Channel) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Configuration options for a managed channel
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Channel identifier for logging and recovery lookups
    pub id: String,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,
}

impl ChannelOptions {
    pub fn consuming(queue: &str) -> Self {
        Self {
            id: format!("consumer-{}-{}", queue, short_id()),
            confirm_mode: false,
        }
    }

    pub fn publishing(exchange: &str) -> Self {
        Self {
            id: format!("publisher-{}-{}", exchange, short_id()),
            confirm_mode: true,
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            id: format!("channel-{}", short_id()),
            confirm_mode: false,
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// A channel that outlives the AMQP channel it currently wraps.
///
/// Each `open` creates a new lapin channel on the given link and runs the
/// setup procedure on it; the channel only becomes current once setup has
/// fully succeeded.
pub struct ManagedChannel {
    options: ChannelOptions,
    setup: ChannelSetup,
    channel: Mutex<Option<Channel>>,
    // generation of the connection the current channel was opened on
    opened_on: AsyncMutex<Option<u64>>,
}

impl ManagedChannel {
    pub fn new(options: ChannelOptions, setup: ChannelSetup) -> Self {
        debug!(
            target: "rabbitmq",
            channel_id = %options.id,
            confirm = options.confirm_mode,
            "Creating channel manager"
        );
        Self {
            options,
            setup,
            channel: Mutex::new(None),
            opened_on: AsyncMutex::new(None),
        }
    }

    /// Return the channel ID for logging
    pub fn id(&self) -> &str {
        &self.options.id
    }

    /// The open channel, if there is one.
    pub fn current(&self) -> Option<Channel> {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|ch| ch.status().connected())
            .cloned()
    }

    /// Check if the channel is in a healthy state
    pub fn is_healthy(&self) -> bool {
        self.current().is_some()
    }

    /// Opens a channel on `link` and runs setup, unless a healthy channel
    /// was already opened on that same connection.
    pub(crate) async fn open(&self, link: &Link) -> Result<Channel> {
        let mut opened_on = self.opened_on.lock().await;
        if *opened_on == Some(link.generation) {
            if let Some(channel) = self.current() {
                return Ok(channel);
            }
        }

        debug!(
            target: "rabbitmq",
            channel_id = %self.options.id,
            generation = link.generation,
            "Opening channel"
        );
        let channel = link.connection.create_channel().await.map_err(|e| {
            RabbitMQError::ChannelError(format!("Failed to create channel: {}", e))
        })?;

        if self.options.confirm_mode {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    RabbitMQError::ChannelError(format!("Failed to enable publisher confirms: {}", e))
                })?;
        }

        if let Err(err) = (self.setup)(channel.clone()).await {
            if channel.status().connected() {
                if let Err(close_err) = channel.close(200, "Channel setup failed").await {
                    warn!(target: "rabbitmq", channel_id = %self.options.id, error = %close_err, "Failed to close channel");
                }
            }
            return Err(err);
        }

        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = Some(channel.clone());
        *opened_on = Some(link.generation);
        Ok(channel)
    }

    pub(crate) async fn close(&self) {
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(channel) = channel.filter(|ch| ch.status().connected()) {
            if let Err(e) = channel.close(200, "Closing channel").await {
                debug!(target: "rabbitmq", channel_id = %self.options.id, error = %e, "Channel close failed");
            }
        }
    }
}

impl std::fmt::Debug for ManagedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedChannel")
            .field("options", &self.options)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_setup() -> ChannelSetup {
        Arc::new(|_channel: Channel| -> BoxFuture<'static, Result<()>> { Box::pin(async { Ok(()) }) })
    }

    #[test]
    fn channel_ids_name_their_role() {
        let consuming = ChannelOptions::consuming("orders_created");
        assert!(consuming.id.starts_with("consumer-orders_created-"));
        assert!(!consuming.confirm_mode);

        let publishing = ChannelOptions::publishing("orders");
        assert!(publishing.id.starts_with("publisher-orders-"));
        assert!(publishing.confirm_mode);

        assert_ne!(ChannelOptions::default().id, ChannelOptions::default().id);
    }

    #[test]
    fn unopened_channel_is_not_healthy() {
        let managed = ManagedChannel::new(ChannelOptions::default(), noop_setup());
        assert!(managed.current().is_none());
        assert!(!managed.is_healthy());
    }
}
