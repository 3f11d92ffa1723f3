//! Outbound path to the broker, shared by publishing and release.

use crate::broker::RawProducer;
use crate::error::BroadcastError;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Sends a message to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `message`, held back for `delay` when given.
    async fn send(&self, message: &Message, delay: Option<Duration>) -> Result<(), BroadcastError>;
}

/// [`Transport`] over a raw broker producer.
pub struct BrokerTransport {
    producer: Arc<dyn RawProducer>,
}

impl BrokerTransport {
    pub fn new(producer: Arc<dyn RawProducer>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    async fn send(&self, message: &Message, delay: Option<Duration>) -> Result<(), BroadcastError> {
        let raw = message.to_raw()?;
        tracing::debug!(
            event = %raw.routing_key,
            attempts = raw.properties.attempts,
            delay_ms = delay.map(|d| d.as_millis() as u64),
            "Sending message"
        );
        self.producer.send(raw, delay).await?;
        Ok(())
    }
}
