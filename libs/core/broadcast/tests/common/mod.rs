//! Shared fixtures: an in-memory broker wired to a subscribed consumer and a
//! publisher, plus listeners that record what they saw.

use async_trait::async_trait;
use broadcast::{
    BroadcastError, BrokerConnection, Consumer, Dispatcher, ExceptionReporter, InMemoryBroker,
    LifecycleEvent, LifecycleEvents, LifecycleSubscriber, Listener, ListenerError, MemoryProbe,
    Processor, Publisher, Subscription, Worker,
};
use core_config::{tracing::init_tracing, Environment};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init() {
    init_tracing(&Environment::Development);
}

pub struct TestBroker {
    pub broker: InMemoryBroker,
    pub consumer: Consumer,
    pub publisher: Publisher,
    pub queue: String,
}

impl TestBroker {
    pub async fn subscribe(service: &str, events: &[&str]) -> Self {
        init();
        let broker = InMemoryBroker::new();
        let client = broker.connect().await.unwrap();
        let subscription = Subscription::new(service, events.iter().copied());
        let consumer = Consumer::subscribe(client.as_ref(), &subscription)
            .await
            .unwrap();
        let publisher = Publisher::connect(client.as_ref(), &subscription.topic)
            .await
            .unwrap();

        Self {
            broker,
            consumer,
            publisher,
            queue: subscription.queue_name(),
        }
    }

    pub fn acked(&self) -> u64 {
        self.broker.acked_count(&self.queue)
    }

    /// Messages still to be delivered, delayed or not.
    pub fn outstanding(&self) -> usize {
        self.broker.ready_count(&self.queue) + self.broker.scheduled_count(&self.queue)
    }
}

/// Lifecycle subscriber recording `name:listener` per event, and the
/// attempt count seen at each `handling`.
#[derive(Default)]
pub struct EventLog {
    entries: Mutex<Vec<String>>,
    attempts: Mutex<Vec<u32>>,
}

impl EventLog {
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.entries()
            .iter()
            .filter(|entry| entry.split(':').next() == Some(name))
            .count()
    }
}

impl LifecycleSubscriber for EventLog {
    fn on_event(&self, event: &LifecycleEvent<'_>) {
        if let LifecycleEvent::Handling(handler) = event {
            self.attempts.lock().unwrap().push(handler.attempts());
        }
        self.entries.lock().unwrap().push(format!(
            "{}:{}",
            event.name(),
            event.handler().listener_class()
        ));
    }
}

#[derive(Default)]
pub struct Reports {
    pub kinds: Mutex<Vec<&'static str>>,
}

impl ExceptionReporter for Reports {
    fn report(&self, error: &BroadcastError) {
        self.kinds.lock().unwrap().push(error.kind());
    }
}

pub struct NoMemory;

impl MemoryProbe for NoMemory {
    fn used_megabytes(&self) -> u64 {
        0
    }
}

pub fn processor(dispatcher: Dispatcher, log: Arc<EventLog>) -> Processor {
    let mut events = LifecycleEvents::with_defaults("test");
    events.subscribe(log);
    Processor::new(Arc::new(dispatcher), events)
}

pub fn worker(reports: Arc<Reports>, poll: Duration) -> Worker {
    Worker::new()
        .with_signals(false)
        .with_exit_on_timeout(false)
        .with_poll_interval(poll)
        .with_reporter(reports)
        .with_memory_probe(Arc::new(NoMemory))
}

/// Listener replaying scripted results and recording each call.
#[derive(Clone, Default)]
pub struct Recording {
    pub calls: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    pub failed_hook: Arc<Mutex<Vec<String>>>,
    script: Arc<Mutex<VecDeque<Result<Value, &'static str>>>>,
    deliberate: bool,
}

impl Recording {
    /// Always returns `value`.
    pub fn returning(value: Value) -> Self {
        let listener = Self::default();
        listener.script.lock().unwrap().push_back(Ok(value));
        listener
    }

    /// Replays `results` in order, then keeps repeating the last one.
    pub fn scripted(results: Vec<Result<Value, &'static str>>) -> Self {
        let listener = Self::default();
        listener.script.lock().unwrap().extend(results);
        listener
    }

    /// Errors are raised as deliberate failures.
    pub fn deliberately(mut self) -> Self {
        self.deliberate = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_result(&self) -> Result<Value, &'static str> {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap_or(Ok(Value::Null))
        } else {
            script.front().cloned().unwrap_or(Ok(Value::Null))
        }
    }
}

#[async_trait]
impl Listener for Recording {
    async fn handle(&self, event: &str, args: &[Value]) -> Result<Value, ListenerError> {
        self.calls
            .lock()
            .unwrap()
            .push((event.to_string(), args.to_vec()));

        match self.next_result() {
            Ok(value) => Ok(value),
            Err(message) if self.deliberate => Err(ListenerError::fail(message)),
            Err(message) => Err(ListenerError::runtime(message)),
        }
    }

    async fn failed(&self, _args: &[Value], error: &BroadcastError) -> Result<(), ListenerError> {
        self.failed_hook.lock().unwrap().push(error.to_string());
        Ok(())
    }
}
