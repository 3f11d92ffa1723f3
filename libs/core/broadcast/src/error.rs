//! Error types for event broadcasting.
//!
//! Three layers, each with its own enum:
//! - [`BrokerError`]: what a raw broker client reports
//! - [`ListenerError`]: what a listener body returns
//! - [`BroadcastError`]: the taxonomy the processor and worker act on

use std::time::Duration;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by a broker client (connection, declare, send, receive).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Transport to the broker dropped
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The broker refused the operation
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// Topic or queue does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else the client reports
    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether this is a connectivity fault.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BrokerError::ConnectionLost(_))
    }
}

/// Error returned from a listener body.
///
/// # Categories
///
/// - **Failed**: the listener asks for the message to fail now, without retry
/// - **Runtime**: anything else, retried via release until `max_tries`
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Deliberate failure: do not retry
    #[error("listener failed: {message}")]
    Failed {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Generic failure: retried with delay
    #[error("{message}")]
    Runtime {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl ListenerError {
    /// Create a deliberate failure.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a deliberate failure with a source.
    pub fn fail_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a generic (retryable) error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            source: None,
        }
    }

    /// Create a generic (retryable) error with a source.
    pub fn runtime_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Runtime {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the listener asked to skip retries.
    pub fn is_deliberate(&self) -> bool {
        matches!(self, ListenerError::Failed { .. })
    }
}

impl From<serde_json::Error> for ListenerError {
    fn from(err: serde_json::Error) -> Self {
        ListenerError::runtime_with_source("payload could not be decoded", err)
    }
}

/// Errors the processor and worker act on.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// Broker transport dropped; the worker shuts down cleanly
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),

    /// The message was already past `max_tries` before this run began
    #[error("listener [{listener}] has been attempted too many times ({attempts})")]
    MaxAttemptsExceeded { listener: String, attempts: u32 },

    /// A listener body returned an error
    #[error("listener [{listener}] raised: {source}")]
    Listener {
        listener: String,
        #[source]
        source: ListenerError,
    },

    /// A named listener could not be resolved to an instance
    #[error("target [{0}] is not instantiable")]
    BindingResolution(String),

    /// A single message took longer than the configured timeout
    #[error("message processing exceeded the timeout of {0:?}")]
    Timeout(Duration),

    /// Release was requested on a message that was never bound to a transport
    #[error("message is not bound to a transport")]
    TransportMissing,

    /// Non-connectivity broker error
    #[error(transparent)]
    Broker(BrokerError),

    /// Message body could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BroadcastError {
    /// Whether this error means the broker connection is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BroadcastError::ConnectionLost(_))
    }

    /// Whether a listener signalled "fail now, do not retry".
    pub fn is_deliberate_failure(&self) -> bool {
        matches!(self, BroadcastError::Listener { source, .. } if source.is_deliberate())
    }

    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BroadcastError::ConnectionLost(_) => "connection_lost",
            BroadcastError::MaxAttemptsExceeded { .. } => "max_attempts_exceeded",
            BroadcastError::Listener { source, .. } if source.is_deliberate() => "failed",
            BroadcastError::Listener { .. } => "runtime",
            BroadcastError::BindingResolution(_) => "binding_resolution",
            BroadcastError::Timeout(_) => "timeout",
            BroadcastError::TransportMissing => "transport_missing",
            BroadcastError::Broker(_) => "broker",
            BroadcastError::Serialization(_) => "serialization",
        }
    }
}

impl From<BrokerError> for BroadcastError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::ConnectionLost(reason) => BroadcastError::ConnectionLost(reason),
            other => BroadcastError::Broker(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_faults_become_connection_lost() {
        let err: BroadcastError = BrokerError::ConnectionLost("socket closed".into()).into();
        assert!(err.is_connection_lost());

        let err: BroadcastError = BrokerError::Rejected("access refused".into()).into();
        assert!(!err.is_connection_lost());
        assert_eq!(err.kind(), "broker");
    }

    #[test]
    fn test_deliberate_failure_detection() {
        let failed = BroadcastError::Listener {
            listener: "SendInvoice".into(),
            source: ListenerError::fail("customer deleted"),
        };
        assert!(failed.is_deliberate_failure());
        assert_eq!(failed.kind(), "failed");

        let runtime = BroadcastError::Listener {
            listener: "SendInvoice".into(),
            source: ListenerError::runtime("smtp timeout"),
        };
        assert!(!runtime.is_deliberate_failure());
        assert_eq!(runtime.kind(), "runtime");
    }

    #[test]
    fn test_error_messages() {
        let err = BroadcastError::MaxAttemptsExceeded {
            listener: "SendInvoice".into(),
            attempts: 4,
        };
        assert_eq!(
            err.to_string(),
            "listener [SendInvoice] has been attempted too many times (4)"
        );
        assert_eq!(
            BroadcastError::BindingResolution("Missing".into()).to_string(),
            "target [Missing] is not instantiable"
        );
    }
}
