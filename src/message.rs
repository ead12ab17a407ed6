use std::borrow::Cow;

use lapin::message::Delivery;
use lapin::BasicProperties;
use serde::Serialize;
use serde_json::Value;

/// A message handed out by the broker, detached from the lapin delivery so
/// it can be cloned into processors and logged after the fact.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl InboundMessage {
    /// Publish timestamp (seconds since the epoch), when the publisher set one.
    pub fn timestamp(&self) -> Option<u64> {
        *self.properties.timestamp()
    }

    /// Raw payload as text, for log context.
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type().as_ref().map(|ct| ct.as_str())
    }
}

impl From<Delivery> for InboundMessage {
    fn from(delivery: Delivery) -> Self {
        InboundMessage {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// Decodes a payload as JSON. Bodies are not schema-checked here; any valid
/// JSON document is accepted.
pub fn decode_payload(data: &[u8]) -> Result<Value, serde_json::Error> {
    serde_json::from_slice(data)
}

pub fn encode_payload<T: Serialize + ?Sized>(data: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(data)
}
