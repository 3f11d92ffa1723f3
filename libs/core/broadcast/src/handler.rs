//! One attempt of one listener on one message.

use crate::dispatcher::BoundListener;
use crate::error::BroadcastError;
use crate::message::Message;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Binds a resolved listener to a received message for a single attempt.
///
/// `failed` and `released` only ever go from `false` to `true`. Release is a
/// no-op once either flag is set; the processor decides which one applies.
pub struct Handler<'a> {
    message: &'a Message,
    listener: &'a BoundListener,
    failed: bool,
    released: bool,
    started: Option<Instant>,
}

impl<'a> Handler<'a> {
    pub fn new(message: &'a Message, listener: &'a BoundListener) -> Self {
        Self {
            message,
            listener,
            failed: false,
            released: false,
            started: None,
        }
    }

    pub fn message(&self) -> &Message {
        self.message
    }

    pub fn listener_class(&self) -> &str {
        self.listener.class()
    }

    pub fn attempts(&self) -> u32 {
        self.message.attempts()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Time spent since `handle` was entered.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|started| started.elapsed())
    }

    /// Invoke the listener with the message's event and payload.
    pub async fn handle(&mut self) -> Result<Value, BroadcastError> {
        self.started = Some(Instant::now());
        self.listener
            .call(self.message.event(), self.message.payload())
            .await
    }

    /// Mark the attempt failed and run the listener's failure hook. Errors
    /// from the hook propagate.
    pub async fn fail(&mut self, error: &BroadcastError) -> Result<(), BroadcastError> {
        self.failed = true;
        self.listener.fail(self.message.payload(), error).await
    }

    /// Send the message back for redelivery after `delay`.
    pub async fn release(&mut self, delay: Duration) -> Result<(), BroadcastError> {
        if self.failed || self.released {
            return Ok(());
        }
        self.message.release(delay).await?;
        self.released = true;
        Ok(())
    }
}
