//! Publishing domain events.

use crate::broker::{BrokerClient, Destination};
use crate::error::BroadcastError;
use crate::message::Message;
use crate::payload::Payload;
use crate::transport::{BrokerTransport, Transport};
use serde::Serialize;
use std::sync::Arc;

/// A domain event that can be published.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Serialize)]
/// struct ItemCreated {
///     id: u64,
/// }
///
/// impl Publishable for ItemCreated {
///     fn publish_event_key(&self) -> String {
///         "item.created".into()
///     }
/// }
/// ```
pub trait Publishable: Serialize + Send + Sync {
    /// Routing key the event is published under.
    fn publish_event_key(&self) -> String;

    /// Payload sent with the event. Defaults to the event's serde form.
    fn to_payload(&self) -> Result<Payload, BroadcastError> {
        Ok(Payload::new(serde_json::to_value(self)?))
    }
}

/// Sends fresh messages to a topic.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
}

impl Publisher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Declare `topic` and publish to it.
    pub async fn connect(client: &dyn BrokerClient, topic: &str) -> Result<Self, BroadcastError> {
        client.declare_topic(topic).await?;
        let producer = client
            .create_producer(Destination::Topic(topic.to_string()))
            .await?;
        Ok(Self::new(Arc::new(BrokerTransport::new(producer))))
    }

    pub async fn publish<E: Publishable>(&self, event: &E) -> Result<(), BroadcastError> {
        let message = Message::new(event.publish_event_key(), event.to_payload()?);
        self.send(&message).await
    }

    pub async fn publish_raw(
        &self,
        event: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Result<(), BroadcastError> {
        self.send(&Message::new(event, payload)).await
    }

    /// Send a prepared message as is.
    pub async fn send(&self, message: &Message) -> Result<(), BroadcastError> {
        tracing::debug!(event = %message.event(), "Publishing event");
        self.transport.send(message, None).await
    }
}
