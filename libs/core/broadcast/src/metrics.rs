//! Metrics for listeners and the worker loop.
//!
//! Recorded through the `metrics` facade; installing an exporter is up to
//! the host process.

use crate::lifecycle::{LifecycleEvent, LifecycleSubscriber};
use metrics::{counter, gauge, histogram};

/// Listener metrics, fed from lifecycle events.
#[derive(Clone)]
pub struct BroadcastMetrics {
    service: String,
}

impl BroadcastMetrics {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Record a message pulled off the queue
    pub fn message_received(&self, event: &str) {
        counter!(
            "broadcast_worker_messages_total",
            "service" => self.service.clone(),
            "event" => event.to_string()
        )
        .increment(1);
    }

    pub fn memory_usage(&self, megabytes: u64) {
        gauge!(
            "broadcast_worker_memory_megabytes",
            "service" => self.service.clone()
        )
        .set(megabytes as f64);
    }
}

impl LifecycleSubscriber for BroadcastMetrics {
    fn on_event(&self, event: &LifecycleEvent<'_>) {
        let handler = event.handler();
        let listener = handler.listener_class().to_string();

        match event {
            LifecycleEvent::Handling(_) => {
                counter!(
                    "broadcast_listener_handling_total",
                    "service" => self.service.clone(),
                    "listener" => listener
                )
                .increment(1);
            }
            LifecycleEvent::Handled(_) => {
                counter!(
                    "broadcast_listener_handled_total",
                    "service" => self.service.clone(),
                    "listener" => listener.clone()
                )
                .increment(1);

                if let Some(elapsed) = handler.elapsed() {
                    histogram!(
                        "broadcast_listener_duration_seconds",
                        "service" => self.service.clone(),
                        "listener" => listener
                    )
                    .record(elapsed.as_secs_f64());
                }
            }
            LifecycleEvent::ExceptionOccurred { error, .. } => {
                counter!(
                    "broadcast_listener_exceptions_total",
                    "service" => self.service.clone(),
                    "listener" => listener,
                    "kind" => error.kind()
                )
                .increment(1);
            }
            LifecycleEvent::HandleFailed { error, .. } => {
                counter!(
                    "broadcast_listener_failed_total",
                    "service" => self.service.clone(),
                    "listener" => listener,
                    "kind" => error.kind()
                )
                .increment(1);
            }
        }
    }
}
