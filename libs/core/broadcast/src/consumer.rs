//! Receiving side: turns broker deliveries into [`Message`]s.

use crate::broker::{BrokerClient, Destination, RawConsumer};
use crate::error::BroadcastError;
use crate::message::Message;
use crate::topology::{self, Subscription};
use crate::transport::{BrokerTransport, Transport};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wraps a raw broker consumer.
///
/// Every received message gets its attempt counter bumped, a first-delivery
/// timestamp if it has none, and the transport it can release itself
/// through. Connectivity faults surface as [`BroadcastError::ConnectionLost`].
pub struct Consumer {
    inner: Box<dyn RawConsumer>,
    transport: Arc<dyn Transport>,
}

impl Consumer {
    pub fn new(inner: Box<dyn RawConsumer>, transport: Arc<dyn Transport>) -> Self {
        Self { inner, transport }
    }

    /// Declare the subscription's topology and consume its queue. Released
    /// messages go straight back to that queue.
    pub async fn subscribe(
        client: &dyn BrokerClient,
        subscription: &Subscription,
    ) -> Result<Self, BroadcastError> {
        let queue = topology::declare(client, subscription).await?;
        let inner = client.create_consumer(&queue).await?;
        let producer = client
            .create_producer(Destination::Queue(queue.clone()))
            .await?;

        info!(queue = %queue, topic = %subscription.topic, "Consumer subscribed");
        Ok(Self::new(inner, Arc::new(BrokerTransport::new(producer))))
    }

    /// Wait up to `timeout` for the next message.
    pub async fn next_message(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Message>, BroadcastError> {
        let Some(delivery) = self.inner.receive(timeout).await? else {
            return Ok(None);
        };

        let mut message = Message::from_delivery(delivery);
        message.stamp_timestamp(Utc::now().timestamp_millis());
        message.increment_attempts();
        message.bind_transport(self.transport.clone());

        debug!(
            event = %message.event(),
            attempts = message.attempts(),
            "Message received"
        );
        Ok(Some(message))
    }

    /// Remove the message from the queue.
    pub async fn acknowledge(&mut self, message: &Message) -> Result<(), BroadcastError> {
        match message.delivery_tag() {
            Some(tag) => Ok(self.inner.acknowledge(tag).await?),
            None => {
                warn!(
                    event = %message.event(),
                    "Message has no delivery tag, nothing to acknowledge"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConnection;
    use crate::memory::InMemoryBroker;
    use crate::publisher::Publisher;
    use serde_json::json;

    async fn subscribed(broker: &InMemoryBroker) -> (Consumer, Publisher) {
        let client = broker.connect().await.unwrap();
        let subscription = Subscription::new("billing", ["item.*"]);
        let consumer = Consumer::subscribe(client.as_ref(), &subscription)
            .await
            .unwrap();
        let publisher = Publisher::connect(client.as_ref(), "events").await.unwrap();
        (consumer, publisher)
    }

    #[tokio::test]
    async fn test_first_receipt_is_stamped() {
        let broker = InMemoryBroker::new();
        let (mut consumer, publisher) = subscribed(&broker).await;
        publisher
            .publish_raw("item.created", json!({"id": 1}))
            .await
            .unwrap();

        let message = consumer
            .next_message(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.event(), "item.created");
        assert_eq!(message.attempts(), 1);
        assert!(message.properties().timestamp.is_some());
        assert!(message.has_transport());
        assert!(message.delivery_tag().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_grow_with_each_delivery() {
        let broker = InMemoryBroker::new();
        let (mut consumer, publisher) = subscribed(&broker).await;
        publisher.publish_raw("item.created", json!(1)).await.unwrap();

        let mut first_timestamp = None;
        for expected in 1..=4 {
            let message = consumer
                .next_message(Duration::from_secs(10))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message.attempts(), expected);
            first_timestamp.get_or_insert(message.properties().timestamp);
            assert_eq!(Some(message.properties().timestamp), first_timestamp);

            message.release(Duration::from_secs(1)).await.unwrap();
            consumer.acknowledge(&message).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none() {
        let broker = InMemoryBroker::new();
        let (mut consumer, _) = subscribed(&broker).await;
        let message = consumer.next_message(Duration::from_millis(5)).await.unwrap();
        assert!(message.is_none());
    }

    #[tokio::test]
    async fn test_connection_loss_is_translated() {
        let broker = InMemoryBroker::new();
        let (mut consumer, _) = subscribed(&broker).await;
        broker.disconnect();

        let err = consumer
            .next_message(Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn test_acknowledge_without_tag_is_noop() {
        let broker = InMemoryBroker::new();
        let (mut consumer, _) = subscribed(&broker).await;
        consumer
            .acknowledge(&Message::new("item.created", json!(null)))
            .await
            .unwrap();
    }
}
