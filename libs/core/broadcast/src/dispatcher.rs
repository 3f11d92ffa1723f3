//! Listener registry and resolution.
//!
//! Listeners are registered under an exact event name or a wildcard
//! [`Pattern`]. Resolving an event yields direct listeners in registration
//! order followed by every matching wildcard listener, again in registration
//! order. Resolved lists are cached per event name.
//!
//! A registration is either a closure or a named class. Named classes are
//! looked up in the dispatcher's container when the event is first resolved;
//! a name nobody bound resolves to a listener that fails with
//! [`BroadcastError::BindingResolution`] when invoked.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut dispatcher = Dispatcher::new();
//! dispatcher.bind("SendInvoice", SendInvoice::new(mailer));
//! dispatcher.listen_class("order.paid", "SendInvoice");
//! dispatcher.listen_fn("order.*", |event, args| async move {
//!     tracing::info!(%event, ?args, "Order event");
//!     Ok(Value::Null)
//! });
//! ```

use crate::error::{BroadcastError, ListenerError};
use crate::pattern::Pattern;
use crate::payload::Payload;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Class tag recorded in `handlers-passed` for closure listeners.
///
/// Every closure shares this tag. Once one closure on an event completes, any
/// later closure on the same event is treated as already passed and skipped,
/// on the first delivery as well as on redelivery. Register distinct work as
/// class listeners when each one must run.
pub const CLOSURE_CLASS: &str = "Closure";

pub type ListenerFuture = BoxFuture<'static, Result<Value, ListenerError>>;

/// A closure listener: `(event, args) -> result`.
pub type ListenerFn = Arc<dyn Fn(String, Vec<Value>) -> ListenerFuture + Send + Sync>;

type ListenerFactory = Arc<dyn Fn() -> Arc<dyn Listener> + Send + Sync>;

/// A named gate run before a class listener. Returning `false` stops the
/// call; the listener is not invoked and the call yields `null`.
#[derive(Clone)]
pub struct Middleware {
    name: String,
    check: Arc<dyn Fn(&str, &[Value]) -> bool + Send + Sync>,
}

impl Middleware {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&str, &[Value]) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allows(&self, event: &str, args: &[Value]) -> bool {
        (self.check)(event, args)
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Middleware").field(&self.name).finish()
    }
}

/// A class listener.
///
/// `middleware` and `failed` are opt-in capabilities; the defaults do
/// nothing.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Handle one event. Returning `Value::Bool(false)` stops propagation to
    /// the remaining listeners of the message.
    async fn handle(&self, event: &str, args: &[Value]) -> Result<Value, ListenerError>;

    /// Middleware declared by the listener itself, run after any middleware
    /// given at registration.
    fn middleware(&self) -> Vec<Middleware> {
        Vec::new()
    }

    /// Called once when the message is failed for good.
    async fn failed(&self, _args: &[Value], _error: &BroadcastError) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// What was registered for a pattern.
#[derive(Clone)]
pub enum Registration {
    Closure(ListenerFn),
    Class {
        name: String,
        middleware: Vec<Middleware>,
    },
}

impl Registration {
    pub fn closure<F, Fut>(f: F) -> Self
    where
        F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ListenerError>> + Send + 'static,
    {
        Registration::Closure(Arc::new(move |event: String, args: Vec<Value>| {
            f(event, args).boxed()
        }))
    }

    pub fn class(name: impl Into<String>) -> Self {
        Registration::Class {
            name: name.into(),
            middleware: Vec::new(),
        }
    }

    pub fn class_with(name: impl Into<String>, middleware: Vec<Middleware>) -> Self {
        Registration::Class {
            name: name.into(),
            middleware,
        }
    }

    fn class_name(&self) -> &str {
        match self {
            Registration::Closure(_) => CLOSURE_CLASS,
            Registration::Class { name, .. } => name,
        }
    }
}

#[derive(Clone)]
enum Target {
    Closure(ListenerFn),
    Instance {
        listener: Arc<dyn Listener>,
        middleware: Vec<Middleware>,
    },
    Unresolved,
}

/// A listener resolved for one event, ready to call.
#[derive(Clone)]
pub struct BoundListener {
    class: String,
    wildcard: bool,
    target: Target,
}

impl BoundListener {
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Whether this listener was matched through a wildcard pattern.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// Arguments the listener receives for `payload`: spread for direct
    /// listeners, a single wrapped value for wildcard listeners.
    pub fn arguments(&self, payload: &Payload) -> Vec<Value> {
        if self.wildcard {
            payload.as_single_argument()
        } else {
            payload.spread()
        }
    }

    /// Run the middleware chain, then the listener.
    pub async fn call(&self, event: &str, payload: &Payload) -> Result<Value, BroadcastError> {
        let args = self.arguments(payload);
        let result = match &self.target {
            Target::Closure(callback) => callback(event.to_string(), args).await,
            Target::Instance {
                listener,
                middleware,
            } => {
                let declared = listener.middleware();
                if let Some(blocked) = middleware
                    .iter()
                    .chain(declared.iter())
                    .find(|m| !m.allows(event, &args))
                {
                    debug!(
                        event = %event,
                        listener = %self.class,
                        middleware = %blocked.name(),
                        "Middleware stopped propagation"
                    );
                    return Ok(Value::Null);
                }
                listener.handle(event, &args).await
            }
            Target::Unresolved => return Err(BroadcastError::BindingResolution(self.class.clone())),
        };

        result.map_err(|source| BroadcastError::Listener {
            listener: self.class.clone(),
            source,
        })
    }

    /// Invoke the listener's failure hook. Closures have none.
    pub async fn fail(
        &self,
        payload: &Payload,
        error: &BroadcastError,
    ) -> Result<(), BroadcastError> {
        match &self.target {
            Target::Instance { listener, .. } => listener
                .failed(&self.arguments(payload), error)
                .await
                .map_err(|source| BroadcastError::Listener {
                    listener: self.class.clone(),
                    source,
                }),
            Target::Closure(_) | Target::Unresolved => Ok(()),
        }
    }
}

impl fmt::Debug for BoundListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundListener")
            .field("class", &self.class)
            .field("wildcard", &self.wildcard)
            .finish()
    }
}

/// Registry of listeners, built once at startup and shared by reference.
#[derive(Default)]
pub struct Dispatcher {
    direct: HashMap<String, Vec<Registration>>,
    wildcards: Vec<(Pattern, Vec<Registration>)>,
    container: HashMap<String, ListenerFactory>,
    cache: Mutex<HashMap<String, Arc<[BoundListener]>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `registration` under an event name or wildcard pattern.
    /// Duplicate registrations are kept as separate entries.
    pub fn listen(&mut self, pattern: &str, registration: Registration) {
        if Pattern::is_wildcard(pattern) {
            match self.wildcards.iter_mut().find(|(p, _)| p.as_str() == pattern) {
                Some((_, registrations)) => registrations.push(registration),
                None => self
                    .wildcards
                    .push((Pattern::new(pattern), vec![registration])),
            }
        } else {
            self.direct
                .entry(pattern.to_string())
                .or_default()
                .push(registration);
        }
        self.invalidate();
    }

    /// Register a closure listener.
    ///
    /// Closures are recorded under [`CLOSURE_CLASS`], so only the first
    /// closure registered for an event runs per message.
    pub fn listen_fn<F, Fut>(&mut self, pattern: &str, f: F)
    where
        F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ListenerError>> + Send + 'static,
    {
        self.listen(pattern, Registration::closure(f));
    }

    pub fn listen_class(&mut self, pattern: &str, name: impl Into<String>) {
        self.listen(pattern, Registration::class(name));
    }

    /// Bind a shared listener instance under `name`.
    pub fn bind<L: Listener + 'static>(&mut self, name: impl Into<String>, listener: L) {
        let listener: Arc<dyn Listener> = Arc::new(listener);
        self.bind_factory(name, move || listener.clone());
    }

    /// Bind a factory that builds the listener for `name` on resolution.
    pub fn bind_factory<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Listener> + Send + Sync + 'static,
    {
        self.container.insert(name.into(), Arc::new(factory));
        self.invalidate();
    }

    pub fn has_listeners(&self, event: &str) -> bool {
        self.direct.get(event).is_some_and(|r| !r.is_empty())
            || self.wildcards.iter().any(|(p, _)| p.matches(event))
    }

    /// Listeners for `event`: direct first, then wildcard matches.
    pub fn get_listeners(&self, event: &str) -> Arc<[BoundListener]> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.get(event) {
            return cached.clone();
        }

        let direct = self
            .direct
            .get(event)
            .into_iter()
            .flatten()
            .map(|registration| self.resolve(registration, false));
        let wildcard = self
            .wildcards
            .iter()
            .filter(|(pattern, _)| pattern.matches(event))
            .flat_map(|(_, registrations)| registrations)
            .map(|registration| self.resolve(registration, true));

        let resolved: Arc<[BoundListener]> = direct.chain(wildcard).collect();
        cache.insert(event.to_string(), resolved.clone());
        resolved
    }

    fn resolve(&self, registration: &Registration, wildcard: bool) -> BoundListener {
        let target = match registration {
            Registration::Closure(callback) => Target::Closure(callback.clone()),
            Registration::Class { name, middleware } => match self.container.get(name) {
                Some(factory) => Target::Instance {
                    listener: factory(),
                    middleware: middleware.clone(),
                },
                None => Target::Unresolved,
            },
        };
        BoundListener {
            class: registration.class_name().to_string(),
            wildcard,
            target,
        }
    }

    fn invalidate(&mut self) {
        self.cache
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
