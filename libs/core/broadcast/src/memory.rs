//! In-process broker.
//!
//! Implements the full [`BrokerClient`] surface with topic exchanges, queues,
//! pattern bindings, delayed sends and acknowledgement tracking. Deliveries
//! left unacknowledged go back to the head of their queue when the consumer
//! holding them is dropped or the connection goes away. Shared state
//! lives behind one mutex; a [`Notify`] wakes waiting consumers. Delays use
//! tokio's clock, so paused-time tests advance through them instantly.
//!
//! ```rust,ignore
//! let broker = InMemoryBroker::new();
//! let client = broker.connect().await?;
//! let subscription = Subscription::new("billing", ["item.*"]);
//! let mut consumer = Consumer::subscribe(client.as_ref(), &subscription).await?;
//! ```

use crate::broker::{
    BrokerClient, BrokerConnection, DeliveryTag, Destination, RawConsumer, RawDelivery, RawMessage,
    RawProducer,
};
use crate::error::BrokerError;
use crate::pattern::Pattern;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<RawMessage>,
    unacked: HashMap<DeliveryTag, Unacked>,
    acked: u64,
}

struct Unacked {
    consumer: u64,
    message: RawMessage,
}

struct Binding {
    topic: String,
    queue: String,
    pattern: Pattern,
}

struct Scheduled {
    due: Instant,
    queue: String,
    message: RawMessage,
}

struct State {
    connected: bool,
    topics: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    scheduled: Vec<Scheduled>,
    next_tag: u64,
    next_consumer: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            connected: true,
            topics: HashSet::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            scheduled: Vec::new(),
            next_tag: 1,
            next_consumer: 1,
        }
    }
}

impl State {
    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected {
            Ok(())
        } else {
            Err(BrokerError::ConnectionLost("in-memory broker disconnected".into()))
        }
    }

    fn queue_mut(&mut self, queue: &str) -> Result<&mut QueueState, BrokerError> {
        self.queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))
    }

    /// Move scheduled messages whose delay has elapsed onto their queues.
    fn promote_due(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.scheduled)
            .into_iter()
            .partition(|scheduled| scheduled.due <= now);
        self.scheduled = pending;

        for scheduled in due {
            if let Some(queue) = self.queues.get_mut(&scheduled.queue) {
                queue.ready.push_back(scheduled.message);
            }
        }
    }

    /// Return unacknowledged deliveries to the head of their queues, in
    /// delivery order. `Some(consumer)` limits this to one consumer's.
    fn requeue_unacked(&mut self, consumer: Option<u64>) {
        for queue in self.queues.values_mut() {
            let mut returned: Vec<(DeliveryTag, RawMessage)> = Vec::new();
            queue.unacked.retain(|tag, delivery| {
                if consumer.is_some_and(|id| id != delivery.consumer) {
                    return true;
                }
                returned.push((*tag, delivery.message.clone()));
                false
            });
            returned.sort_by_key(|(tag, _)| tag.0);
            for (_, message) in returned.into_iter().rev() {
                queue.ready.push_front(message);
            }
        }
    }

    fn next_due(&self, queue: &str) -> Option<Instant> {
        self.scheduled
            .iter()
            .filter(|scheduled| scheduled.queue == queue)
            .map(|scheduled| scheduled.due)
            .min()
    }

    /// Queues a topic publish reaches. Each queue receives one copy no matter
    /// how many of its bindings match.
    fn route(&self, topic: &str, routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if binding.topic == topic
                && binding.pattern.matches(routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }

    fn enqueue(&mut self, queue: String, message: RawMessage, delay: Option<Duration>) {
        match delay.filter(|delay| !delay.is_zero()) {
            Some(delay) => self.scheduled.push(Scheduled {
                due: Instant::now() + delay,
                queue,
                message,
            }),
            None => {
                if let Some(state) = self.queues.get_mut(&queue) {
                    state.ready.push_back(message);
                }
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

/// Broker that keeps everything in process memory.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the "connection": every further operation fails with
    /// [`BrokerError::ConnectionLost`] and unacknowledged deliveries are
    /// requeued.
    pub fn disconnect(&self) {
        {
            let mut state = self.lock();
            state.connected = false;
            state.requeue_unacked(None);
        }
        self.shared.notify.notify_waiters();
    }

    pub fn reconnect(&self) {
        self.lock().connected = true;
    }

    /// Messages visible to consumers of `queue` right now.
    pub fn ready_count(&self, queue: &str) -> usize {
        let mut state = self.lock();
        state.promote_due(Instant::now());
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages waiting on a delay for `queue`.
    pub fn scheduled_count(&self, queue: &str) -> usize {
        self.lock()
            .scheduled
            .iter()
            .filter(|scheduled| scheduled.queue == queue)
            .count()
    }

    /// Delivered but not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Total acknowledgements received for `queue`.
    pub fn acked_count(&self, queue: &str) -> u64 {
        self.lock().queues.get(queue).map_or(0, |q| q.acked)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        self.lock().ensure_connected()?;
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn declare_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.topics.insert(topic.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind(&self, topic: &str, queue: &str, routing_key: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.ensure_connected()?;
        if !state.topics.contains(topic) {
            return Err(BrokerError::NotFound(format!("topic '{topic}'")));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue '{queue}'")));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.topic == topic && b.queue == queue && b.pattern.as_str() == routing_key);
        if !exists {
            state.bindings.push(Binding {
                topic: topic.to_string(),
                queue: queue.to_string(),
                pattern: Pattern::new(routing_key),
            });
        }
        Ok(())
    }

    async fn create_consumer(&self, queue: &str) -> Result<Box<dyn RawConsumer>, BrokerError> {
        let mut state = self.lock();
        state.ensure_connected()?;
        state.queue_mut(queue)?;
        let id = state.next_consumer;
        state.next_consumer += 1;
        Ok(Box::new(InMemoryConsumer {
            id,
            broker: self.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn create_producer(
        &self,
        destination: Destination,
    ) -> Result<Arc<dyn RawProducer>, BrokerError> {
        let mut state = self.lock();
        state.ensure_connected()?;
        match &destination {
            Destination::Topic(topic) if !state.topics.contains(topic) => {
                return Err(BrokerError::NotFound(format!("topic '{topic}'")));
            }
            Destination::Queue(queue) => {
                state.queue_mut(queue)?;
            }
            Destination::Topic(_) => {}
        }
        Ok(Arc::new(InMemoryProducer {
            broker: self.clone(),
            destination,
        }))
    }
}

struct InMemoryProducer {
    broker: InMemoryBroker,
    destination: Destination,
}

#[async_trait]
impl RawProducer for InMemoryProducer {
    async fn send(&self, message: RawMessage, delay: Option<Duration>) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.lock();
            state.ensure_connected()?;
            let targets = match &self.destination {
                Destination::Topic(topic) => state.route(topic, &message.routing_key),
                Destination::Queue(queue) => {
                    state.queue_mut(queue)?;
                    vec![queue.clone()]
                }
            };
            if targets.is_empty() {
                tracing::debug!(
                    routing_key = %message.routing_key,
                    "Message matched no binding, dropped"
                );
            }
            for queue in targets {
                state.enqueue(queue, message.clone(), delay);
            }
        }
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }
}

struct InMemoryConsumer {
    id: u64,
    broker: InMemoryBroker,
    queue: String,
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        self.broker.lock().requeue_unacked(Some(self.id));
        self.broker.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl RawConsumer for InMemoryConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<RawDelivery>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.broker.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.broker.lock();
                state.ensure_connected()?;
                let now = Instant::now();
                state.promote_due(now);

                let tag = DeliveryTag(state.next_tag);
                let queue = state.queue_mut(&self.queue)?;
                if let Some(message) = queue.ready.pop_front() {
                    queue.unacked.insert(
                        tag,
                        Unacked {
                            consumer: self.id,
                            message: message.clone(),
                        },
                    );
                    state.next_tag += 1;
                    return Ok(Some(RawDelivery { tag, message }));
                }

                if now >= deadline {
                    return Ok(None);
                }
                state
                    .next_due(&self.queue)
                    .map_or(deadline, |due| due.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_connected()?;
        let queue = state.queue_mut(&self.queue)?;
        match queue.unacked.remove(tag) {
            Some(_) => {
                queue.acked += 1;
                Ok(())
            }
            None => Err(BrokerError::NotFound(format!("delivery {tag}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Properties;

    fn raw(routing_key: &str) -> RawMessage {
        RawMessage {
            routing_key: routing_key.to_string(),
            body: b"{}".to_vec(),
            properties: Properties::default(),
        }
    }

    async fn setup(broker: &InMemoryBroker, queue: &str, pattern: &str) {
        broker.declare_topic("events").await.unwrap();
        broker.declare_queue(queue).await.unwrap();
        broker.bind("events", queue, pattern).await.unwrap();
    }

    #[tokio::test]
    async fn test_topic_routing_by_pattern() {
        let broker = InMemoryBroker::new();
        setup(&broker, "billing", "item.*").await;
        setup(&broker, "audit", "#").await;
        broker.declare_queue("orders").await.unwrap();
        broker.bind("events", "orders", "order.created").await.unwrap();

        let producer = broker
            .create_producer(Destination::Topic("events".into()))
            .await
            .unwrap();
        producer.send(raw("item.created"), None).await.unwrap();

        assert_eq!(broker.ready_count("billing"), 1);
        assert_eq!(broker.ready_count("audit"), 1);
        assert_eq!(broker.ready_count("orders"), 0);
    }

    #[tokio::test]
    async fn test_one_copy_per_queue_with_overlapping_bindings() {
        let broker = InMemoryBroker::new();
        setup(&broker, "billing", "item.*").await;
        broker.bind("events", "billing", "item.created").await.unwrap();

        let producer = broker
            .create_producer(Destination::Topic("events".into()))
            .await
            .unwrap();
        producer.send(raw("item.created"), None).await.unwrap();

        assert_eq!(broker.ready_count("billing"), 1);
    }

    #[tokio::test]
    async fn test_receive_and_acknowledge() {
        let broker = InMemoryBroker::new();
        setup(&broker, "billing", "item.created").await;
        let producer = broker
            .create_producer(Destination::Queue("billing".into()))
            .await
            .unwrap();
        producer.send(raw("item.created"), None).await.unwrap();

        let mut consumer = broker.create_consumer("billing").await.unwrap();
        let delivery = consumer
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.routing_key, "item.created");
        assert_eq!(broker.unacked_count("billing"), 1);

        consumer.acknowledge(&delivery.tag).await.unwrap();
        assert_eq!(broker.unacked_count("billing"), 0);
        assert_eq!(broker.acked_count("billing"), 1);

        let again = consumer.acknowledge(&delivery.tag).await.unwrap_err();
        assert!(matches!(again, BrokerError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_when_empty() {
        let broker = InMemoryBroker::new();
        setup(&broker, "billing", "item.created").await;
        let mut consumer = broker.create_consumer("billing").await.unwrap();

        let received = consumer.receive(Duration::from_secs(1)).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_message_becomes_visible_when_due() {
        let broker = InMemoryBroker::new();
        setup(&broker, "billing", "item.created").await;
        let producer = broker
            .create_producer(Destination::Queue("billing".into()))
            .await
            .unwrap();
        producer
            .send(raw("item.created"), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(broker.ready_count("billing"), 0);
        assert_eq!(broker.scheduled_count("billing"), 1);

        let mut consumer = broker.create_consumer("billing").await.unwrap();
        assert!(consumer.receive(Duration::from_secs(1)).await.unwrap().is_none());

        let delivery = consumer.receive(Duration::from_secs(10)).await.unwrap();
        assert!(delivery.is_some());
        assert_eq!(broker.scheduled_count("billing"), 0);
    }

    #[tokio::test]
    async fn test_waiting_consumer_is_woken_by_send() {
        let broker = InMemoryBroker::new();
        setup(&broker, "billing", "item.created").await;
        let mut consumer = broker.create_consumer("billing").await.unwrap();

        let producer = broker
            .create_producer(Destination::Queue("billing".into()))
            .await
            .unwrap();
        let sender = tokio::spawn(async move {
            tokio::task::yield_now().await;
            producer.send(raw("item.created"), None).await.unwrap();
        });

        let delivery = consumer.receive(Duration::from_secs(5)).await.unwrap();
        assert!(delivery.is_some());
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_fails_every_operation() {
        let broker = InMemoryBroker::new();
        setup(&broker, "billing", "item.created").await;
        let mut consumer = broker.create_consumer("billing").await.unwrap();

        broker.disconnect();

        let err = consumer.receive(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(broker.declare_topic("events").await.unwrap_err().is_connection_error());
        assert!(broker.connect().await.is_err());

        broker.reconnect();
        assert!(consumer.receive(Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_consumer_requeues_its_deliveries() {
        let broker = InMemoryBroker::new();
        setup(&broker, "billing", "item.*").await;
        let producer = broker
            .create_producer(Destination::Queue("billing".into()))
            .await
            .unwrap();
        producer.send(raw("item.created"), None).await.unwrap();
        producer.send(raw("item.updated"), None).await.unwrap();
        producer.send(raw("item.deleted"), None).await.unwrap();

        let mut other = broker.create_consumer("billing").await.unwrap();
        let mut first = broker.create_consumer("billing").await.unwrap();
        let wait = Duration::from_millis(10);
        first.receive(wait).await.unwrap().unwrap();
        first.receive(wait).await.unwrap().unwrap();
        let kept = other.receive(wait).await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("billing"), 3);

        drop(first);
        assert_eq!(broker.unacked_count("billing"), 1);
        assert_eq!(broker.ready_count("billing"), 2);

        let redelivered = other.receive(wait).await.unwrap().unwrap();
        assert_eq!(redelivered.message.routing_key, "item.created");
        let redelivered = other.receive(wait).await.unwrap().unwrap();
        assert_eq!(redelivered.message.routing_key, "item.updated");
        assert_eq!(kept.message.routing_key, "item.deleted");
    }

    #[tokio::test]
    async fn test_disconnect_requeues_unacknowledged() {
        let broker = InMemoryBroker::new();
        setup(&broker, "billing", "item.created").await;
        let producer = broker
            .create_producer(Destination::Queue("billing".into()))
            .await
            .unwrap();
        producer.send(raw("item.created"), None).await.unwrap();
        let mut consumer = broker.create_consumer("billing").await.unwrap();
        let delivery = consumer
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        broker.disconnect();
        broker.reconnect();

        assert_eq!(broker.unacked_count("billing"), 0);
        assert_eq!(broker.ready_count("billing"), 1);
        let err = consumer.acknowledge(&delivery.tag).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_bind_requires_declared_topology() {
        let broker = InMemoryBroker::new();
        let err = broker.bind("events", "billing", "#").await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));

        let err = broker.create_consumer("missing").await.err().unwrap();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }
}
