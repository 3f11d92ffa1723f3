//! Broker topology for a consuming service.

use crate::broker::BrokerClient;
use crate::error::BroadcastError;
use crate::naming::resolve_queue_name;
use crate::options::ProcessingOptions;
use tracing::info;

pub const DEFAULT_TOPIC: &str = "events";

/// The events a service consumes and the topic they are published on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub service: String,
    /// Event names or patterns, bound to the queue as routing keys
    pub events: Vec<String>,
}

impl Subscription {
    pub fn new<I, S>(service: impl Into<String>, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            service: service.into(),
            events: events.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_options<I, S>(options: &ProcessingOptions, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(options.service.clone(), events)
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn queue_name(&self) -> String {
        resolve_queue_name(&self.service, &self.events)
    }
}

/// Declare the topic and queue and bind every event. Returns the queue name.
pub async fn declare(
    client: &dyn BrokerClient,
    subscription: &Subscription,
) -> Result<String, BroadcastError> {
    let queue = subscription.queue_name();

    client.declare_topic(&subscription.topic).await?;
    client.declare_queue(&queue).await?;
    for event in &subscription.events {
        client.bind(&subscription.topic, &queue, event).await?;
    }

    info!(
        topic = %subscription.topic,
        queue = %queue,
        events = ?subscription.events,
        "Topology declared"
    );
    Ok(queue)
}
