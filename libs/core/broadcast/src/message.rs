//! The message envelope handed from the consumer to listeners.

use crate::broker::{DeliveryTag, RawDelivery, RawMessage};
use crate::error::BroadcastError;
use crate::payload::Payload;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delivery metadata carried with every message.
///
/// The named fields are the keys the core reads and writes; anything else a
/// publisher sets is kept in `headers` and travels with redeliveries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    /// Number of deliveries observed so far
    #[serde(rename = "x-attempts", default)]
    pub attempts: u32,

    /// Listeners that already completed for this message
    #[serde(rename = "handlers-passed", default, skip_serializing_if = "Vec::is_empty")]
    pub handlers_passed: Vec<String>,

    /// Milliseconds since the epoch of the first observed delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// Event name; falls back to the routing key when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    #[serde(flatten)]
    pub headers: Map<String, Value>,
}

impl Properties {
    /// Record a completed listener. Entries are never removed.
    pub fn record_handler(&mut self, listener: &str) {
        if !self.has_passed(listener) {
            self.handlers_passed.push(listener.to_string());
        }
    }

    pub fn has_passed(&self, listener: &str) -> bool {
        self.handlers_passed.iter().any(|passed| passed == listener)
    }
}

/// An event travelling through the system.
#[derive(Clone)]
pub struct Message {
    event: String,
    payload: Payload,
    properties: Properties,
    delivery: Option<DeliveryTag>,
    transport: Option<Arc<dyn Transport>>,
}

impl Message {
    /// A fresh, never-delivered message.
    pub fn new(event: impl Into<String>, payload: impl Into<Payload>) -> Self {
        let event = event.into();
        let properties = Properties {
            event: Some(event.clone()),
            ..Properties::default()
        };
        Self {
            event,
            payload: payload.into(),
            properties,
            delivery: None,
            transport: None,
        }
    }

    /// Rebuild a message from a broker delivery.
    ///
    /// The event name comes from the `event` property when present, otherwise
    /// from the routing key. A body that is not JSON is kept as a string.
    pub(crate) fn from_delivery(delivery: RawDelivery) -> Self {
        let RawDelivery { tag, message } = delivery;
        let RawMessage {
            routing_key,
            body,
            mut properties,
        } = message;

        let payload = serde_json::from_slice::<Value>(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));

        let event = match &properties.event {
            Some(event) => event.clone(),
            None => {
                properties.event = Some(routing_key.clone());
                routing_key
            }
        };

        Self {
            event,
            payload: Payload::new(payload),
            properties,
            delivery: Some(tag),
            transport: None,
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.headers.insert(key.into(), value);
        self
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn attempts(&self) -> u32 {
        self.properties.attempts
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn delivery_tag(&self) -> Option<&DeliveryTag> {
        self.delivery.as_ref()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub(crate) fn record_handler(&mut self, listener: &str) {
        self.properties.record_handler(listener);
    }

    pub(crate) fn increment_attempts(&mut self) {
        self.properties.attempts = self.properties.attempts.saturating_add(1);
    }

    /// Stamp the first-delivery time. Later deliveries keep the original.
    pub(crate) fn stamp_timestamp(&mut self, millis: i64) {
        self.properties.timestamp.get_or_insert(millis);
    }

    pub(crate) fn bind_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transport = Some(transport);
    }

    /// Send a copy of this message back to the broker for redelivery after
    /// `delay`. The copy keeps the current attempt count and properties.
    pub async fn release(&self, delay: Duration) -> Result<(), BroadcastError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(BroadcastError::TransportMissing)?;
        transport.send(self, Some(delay)).await
    }

    /// Encode for the wire.
    pub fn to_raw(&self) -> Result<RawMessage, BroadcastError> {
        Ok(RawMessage {
            routing_key: self.event.clone(),
            body: serde_json::to_vec(self.payload.value())?,
            properties: self.properties.clone(),
        })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("event", &self.event)
            .field("payload", &self.payload)
            .field("properties", &self.properties)
            .field("delivery", &self.delivery)
            .field("transport", &self.transport.is_some())
            .finish()
    }
}
