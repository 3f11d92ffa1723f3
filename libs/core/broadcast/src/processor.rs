//! Runs the resolved listeners of a message with the retry policy.
//!
//! Decision table for a listener error:
//!
//! | Error                      | Attempts vs `max_tries` | Outcome  |
//! |----------------------------|-------------------------|----------|
//! | deliberate failure         | any                     | failed   |
//! | anything else              | `>= max_tries` (> 0)    | failed   |
//! | anything else              | below, or unlimited     | released |
//!
//! Either way the error is returned to the caller after bookkeeping, and no
//! further listeners run for this delivery.

use crate::dispatcher::Dispatcher;
use crate::error::BroadcastError;
use crate::handler::Handler;
use crate::lifecycle::{LifecycleEvent, LifecycleEvents};
use crate::message::Message;
use crate::options::ProcessingOptions;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How one handler run ended.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// The listener returned a value
    Completed(Value),
    /// The listener errored and the message was sent back for retry
    Released {
        delay: Duration,
        error: BroadcastError,
    },
    /// The listener errored and the message is done
    Failed(BroadcastError),
}

impl HandlerOutcome {
    /// Whether the listener asked to stop propagation.
    pub fn stops_propagation(&self) -> bool {
        matches!(self, HandlerOutcome::Completed(Value::Bool(false)))
    }
}

pub struct Processor {
    dispatcher: Arc<Dispatcher>,
    events: LifecycleEvents,
}

impl Processor {
    pub fn new(dispatcher: Arc<Dispatcher>, events: LifecycleEvents) -> Self {
        Self { dispatcher, events }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run every listener resolved for the message's event, in order.
    ///
    /// Listeners already recorded in `handlers-passed` are skipped; each one
    /// that completes is recorded. A `false` result stops the loop. A listener
    /// error stops the loop and is returned.
    pub async fn process(
        &self,
        message: &mut Message,
        options: &ProcessingOptions,
    ) -> Result<(), BroadcastError> {
        let listeners = self.dispatcher.get_listeners(message.event());

        for listener in listeners.iter() {
            if message.properties().has_passed(listener.class()) {
                debug!(
                    event = %message.event(),
                    listener = %listener.class(),
                    "Listener already passed, skipping"
                );
                continue;
            }

            let outcome = {
                let mut handler = Handler::new(message, listener);
                self.run_handler(&mut handler, options).await?
            };

            if outcome.stops_propagation() {
                message.record_handler(listener.class());
                debug!(
                    event = %message.event(),
                    listener = %listener.class(),
                    "Propagation stopped"
                );
                break;
            }

            match outcome {
                HandlerOutcome::Completed(_) => message.record_handler(listener.class()),
                HandlerOutcome::Released { error, .. } | HandlerOutcome::Failed(error) => {
                    return Err(error);
                }
            }
        }

        Ok(())
    }

    /// Run one handler.
    ///
    /// Returns `Err` only when bookkeeping itself could not complete: the
    /// message was already past `max_tries`, or the release could not be
    /// sent. Listener errors come back as [`HandlerOutcome::Released`] or
    /// [`HandlerOutcome::Failed`].
    pub async fn run_handler(
        &self,
        handler: &mut Handler<'_>,
        options: &ProcessingOptions,
    ) -> Result<HandlerOutcome, BroadcastError> {
        self.events.emit(&LifecycleEvent::Handling(&*handler));

        let attempts = handler.attempts();
        if !options.has_unlimited_tries() && attempts > options.max_tries {
            let error = BroadcastError::MaxAttemptsExceeded {
                listener: handler.listener_class().to_string(),
                attempts,
            };
            let hook = handler.fail(&error).await;
            self.events.emit(&LifecycleEvent::Handled(&*handler));
            hook?;
            return Err(error);
        }

        match handler.handle().await {
            Ok(value) => {
                self.events.emit(&LifecycleEvent::Handled(&*handler));
                Ok(HandlerOutcome::Completed(value))
            }
            Err(error) => self.handle_exception(handler, error, options).await,
        }
    }

    async fn handle_exception(
        &self,
        handler: &mut Handler<'_>,
        error: BroadcastError,
        options: &ProcessingOptions,
    ) -> Result<HandlerOutcome, BroadcastError> {
        let exhausted = !options.has_unlimited_tries() && handler.attempts() >= options.max_tries;
        let should_fail =
            error.is_deliberate_failure() || (!handler.is_failed() && exhausted);

        if should_fail {
            if let Err(hook_error) = self.handle_fail(handler, &error).await {
                return Ok(HandlerOutcome::Failed(hook_error));
            }
        }

        self.events.emit(&LifecycleEvent::ExceptionOccurred {
            handler: &*handler,
            error: &error,
        });

        if !handler.is_released() && !handler.is_failed() {
            handler.release(options.sleep).await?;
            return Ok(HandlerOutcome::Released {
                delay: options.sleep,
                error,
            });
        }

        Ok(HandlerOutcome::Failed(error))
    }

    async fn handle_fail(
        &self,
        handler: &mut Handler<'_>,
        error: &BroadcastError,
    ) -> Result<(), BroadcastError> {
        handler.fail(error).await?;
        self.events.emit(&LifecycleEvent::HandleFailed {
            handler: &*handler,
            error,
        });
        Ok(())
    }
}
