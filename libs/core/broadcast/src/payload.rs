//! Opaque JSON payload carried by a message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON payload of an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Value);

impl Payload {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// The payload as a sequence-or-mapping: arrays and objects pass through,
    /// scalars (and null) become a one-element array.
    pub fn wrap(&self) -> Value {
        match &self.0 {
            Value::Array(_) | Value::Object(_) => self.0.clone(),
            scalar => Value::Array(vec![scalar.clone()]),
        }
    }

    /// Positional arguments for a listener registered under an exact event
    /// name. A single object stays one argument; an array spreads.
    pub fn spread(&self) -> Vec<Value> {
        match self.wrap() {
            Value::Array(items) => items,
            object => vec![object],
        }
    }

    /// Arguments for a wildcard listener: the wrapped payload as one value.
    pub fn as_single_argument(&self) -> Vec<Value> {
        vec![self.wrap()]
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
