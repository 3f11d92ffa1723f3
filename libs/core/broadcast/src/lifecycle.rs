//! Lifecycle notifications emitted while listeners run.

use crate::error::BroadcastError;
use crate::handler::Handler;
use crate::metrics::BroadcastMetrics;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Something that happened to a handler.
pub enum LifecycleEvent<'a> {
    /// About to invoke the listener
    Handling(&'a Handler<'a>),
    /// The listener returned, or the attempt was failed up front
    Handled(&'a Handler<'a>),
    /// The listener returned an error
    ExceptionOccurred {
        handler: &'a Handler<'a>,
        error: &'a BroadcastError,
    },
    /// The message was failed for good
    HandleFailed {
        handler: &'a Handler<'a>,
        error: &'a BroadcastError,
    },
}

impl<'a> LifecycleEvent<'a> {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Handling(_) => "handling",
            LifecycleEvent::Handled(_) => "handled",
            LifecycleEvent::ExceptionOccurred { .. } => "exception_occurred",
            LifecycleEvent::HandleFailed { .. } => "handle_failed",
        }
    }

    pub fn handler(&self) -> &'a Handler<'a> {
        match self {
            LifecycleEvent::Handling(handler) | LifecycleEvent::Handled(handler) => *handler,
            LifecycleEvent::ExceptionOccurred { handler, .. }
            | LifecycleEvent::HandleFailed { handler, .. } => *handler,
        }
    }

    pub fn error(&self) -> Option<&'a BroadcastError> {
        match self {
            LifecycleEvent::ExceptionOccurred { error, .. }
            | LifecycleEvent::HandleFailed { error, .. } => Some(*error),
            _ => None,
        }
    }
}

pub trait LifecycleSubscriber: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent<'_>);
}

/// Fan-out of lifecycle events to subscribers, in subscription order.
#[derive(Clone, Default)]
pub struct LifecycleEvents {
    subscribers: Vec<Arc<dyn LifecycleSubscriber>>,
}

impl LifecycleEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logging plus metrics labelled with `service`.
    pub fn with_defaults(service: impl Into<String>) -> Self {
        let mut events = Self::new();
        events.subscribe(Arc::new(LogSubscriber));
        events.subscribe(Arc::new(BroadcastMetrics::new(service)));
        events
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn LifecycleSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn emit(&self, event: &LifecycleEvent<'_>) {
        for subscriber in &self.subscribers {
            subscriber.on_event(event);
        }
    }
}

/// Writes one log line per lifecycle event.
pub struct LogSubscriber;

impl LifecycleSubscriber for LogSubscriber {
    fn on_event(&self, event: &LifecycleEvent<'_>) {
        let handler = event.handler();
        let message = handler.message();
        match event {
            LifecycleEvent::Handling(_) => debug!(
                event = %message.event(),
                listener = %handler.listener_class(),
                attempts = handler.attempts(),
                "Handling"
            ),
            LifecycleEvent::Handled(_) => info!(
                event = %message.event(),
                listener = %handler.listener_class(),
                attempts = handler.attempts(),
                elapsed_ms = handler.elapsed().map(|d| d.as_millis() as u64),
                "Handled"
            ),
            LifecycleEvent::ExceptionOccurred { error, .. } => warn!(
                event = %message.event(),
                listener = %handler.listener_class(),
                attempts = handler.attempts(),
                error = %error,
                "Listener raised"
            ),
            LifecycleEvent::HandleFailed { error, .. } => error!(
                event = %message.event(),
                listener = %handler.listener_class(),
                attempts = handler.attempts(),
                error = %error,
                "Listener failed"
            ),
        }
    }
}
