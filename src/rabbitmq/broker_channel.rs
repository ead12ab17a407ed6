use async_trait::async_trait;
use lapin::options::{BasicAckOptions, BasicGetOptions, BasicNackOptions};
use lapin::Channel;

use super::errors::Result;
use crate::message::InboundMessage;

/// The acknowledgement and pull operations dispatch needs from a channel.
///
/// Negative acknowledgement never requeues: a rejected message goes to the
/// queue's dead-letter exchange.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    /// Pulls a single message (`basic.get`, manual ack). `None` when the queue is empty.
    async fn get(&self, queue: &str) -> Result<Option<InboundMessage>>;

    fn is_open(&self) -> bool;
}

#[async_trait]
impl BrokerChannel for Channel {
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple,
                requeue: false,
            },
        )
        .await?;
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<InboundMessage>> {
        let message = self
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await?;
        Ok(message.map(|m| InboundMessage::from(m.delivery)))
    }

    fn is_open(&self) -> bool {
        self.status().connected()
    }
}
