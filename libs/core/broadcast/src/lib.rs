//! Event broadcasting over a message broker.
//!
//! Publishers turn domain events into broker messages. A worker consumes a
//! queue, resolves the in-process listeners for each message's routing key
//! (wildcards included), runs them with retry and failure bookkeeping, and
//! emits lifecycle events for logs and metrics.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐  publish   ┌──────────────┐  route   ┌───────────────┐
//! │ Publisher │───────────►│    topic     │─────────►│ service queue │
//! └───────────┘            └──────────────┘          └───────┬───────┘
//!                                                            │ receive
//!        ┌───────────────────────────────────────────────────▼──────┐
//!        │ Worker                                                   │
//!        │   Consumer ──► Processor ──► Handler ──► listener        │
//!        │      ▲             │            │                        │
//!        │      └─ acknowledge┘            └─ release ─► queue      │
//!        └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use broadcast::{
//!     BrokerConnection, Consumer, Dispatcher, InMemoryBroker, LifecycleEvents,
//!     ProcessingOptions, Processor, Subscription, Worker,
//! };
//! use core_config::FromEnv;
//!
//! let options = ProcessingOptions::from_env()?;
//!
//! let mut dispatcher = Dispatcher::new();
//! dispatcher.bind("SendInvoice", SendInvoice::new(mailer));
//! dispatcher.listen_class("order.paid", "SendInvoice");
//!
//! let client = InMemoryBroker::new().connect().await?;
//! let subscription = Subscription::from_options(&options, ["order.paid"]);
//! let mut consumer = Consumer::subscribe(client.as_ref(), &subscription).await?;
//!
//! let processor = Processor::new(
//!     Arc::new(dispatcher),
//!     LifecycleEvents::with_defaults(&options.service),
//! );
//! let status = Worker::new().work(&processor, &mut consumer, &options).await;
//! std::process::exit(status.exit_code());
//! ```

pub mod broker;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod naming;
pub mod options;
pub mod pattern;
pub mod payload;
pub mod processor;
pub mod publisher;
pub mod topology;
pub mod transport;
pub mod worker;

pub use crate::metrics::BroadcastMetrics;
pub use broker::{
    BrokerClient, BrokerConnection, DeliveryTag, Destination, RawConsumer, RawDelivery, RawMessage,
    RawProducer,
};
pub use consumer::Consumer;
pub use dispatcher::{BoundListener, Dispatcher, Listener, Middleware, Registration, CLOSURE_CLASS};
pub use error::{BroadcastError, BrokerError, ListenerError};
pub use handler::Handler;
pub use lifecycle::{LifecycleEvent, LifecycleEvents, LifecycleSubscriber, LogSubscriber};
pub use memory::InMemoryBroker;
pub use message::{Message, Properties};
pub use naming::{resolve_queue_name, MAX_QUEUE_NAME_LEN};
pub use options::ProcessingOptions;
pub use pattern::Pattern;
pub use payload::Payload;
pub use processor::{HandlerOutcome, Processor};
pub use publisher::{Publishable, Publisher};
pub use topology::{Subscription, DEFAULT_TOPIC};
pub use transport::{BrokerTransport, Transport};
pub use worker::{
    shutdown_signal, ExceptionReporter, MemoryProbe, ProcessMemory, ShutdownHandle,
    TracingReporter, Worker, WorkerStatus,
};
