//! Narrow interface to the message broker.
//!
//! Connection bootstrapping (host, credentials, TLS, heartbeats) belongs to
//! whoever implements [`BrokerConnection`]. The core only needs to declare
//! topology, receive and acknowledge deliveries, and send raw messages.
//! [`crate::memory::InMemoryBroker`] is the in-process implementation.

use crate::error::BrokerError;
use crate::message::Properties;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Broker-assigned identifier of one delivery, used to acknowledge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message as it travels over the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub routing_key: String,
    /// JSON-encoded payload
    pub body: Vec<u8>,
    pub properties: Properties,
}

/// A received message plus its delivery tag.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub tag: DeliveryTag,
    pub message: RawMessage,
}

/// Where a producer sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Routed to every queue bound to the topic with a matching pattern
    Topic(String),
    /// Delivered straight to one queue (redelivery of a released message)
    Queue(String),
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerClient>, BrokerError>;
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Declare a topic exchange. Idempotent.
    async fn declare_topic(&self, topic: &str) -> Result<(), BrokerError>;

    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Bind `queue` to `topic` for routing keys matching `routing_key`.
    async fn bind(&self, topic: &str, queue: &str, routing_key: &str) -> Result<(), BrokerError>;

    async fn create_consumer(&self, queue: &str) -> Result<Box<dyn RawConsumer>, BrokerError>;

    async fn create_producer(
        &self,
        destination: Destination,
    ) -> Result<Arc<dyn RawProducer>, BrokerError>;
}

#[async_trait]
pub trait RawConsumer: Send {
    /// Wait up to `timeout` for a delivery. `Ok(None)` when nothing arrived.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<RawDelivery>, BrokerError>;

    async fn acknowledge(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait RawProducer: Send + Sync {
    /// Send a message, optionally held back for `delay` before it becomes
    /// visible to consumers.
    async fn send(&self, message: RawMessage, delay: Option<Duration>) -> Result<(), BrokerError>;
}
