//! Error types for the broker mediation layer.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur on the broker layer.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Broker unreachable at startup. Fatal — surfaced to the process
    /// supervisor for restart, not retried internally.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// An operation was attempted while the channel is down (reconnect in
    /// progress or given up).
    #[error("broker channel not connected")]
    NotConnected,

    /// Malformed payload. Routed to the error observers and acknowledged;
    /// never stops the consume loop.
    #[error("payload parse error: {0}")]
    Parse(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    /// A consumer handler failed; the message stays unacknowledged and is
    /// redelivered.
    #[error("handler error: {0}")]
    Handler(String),

    /// A sync request is already outstanding on this router (single-flight).
    #[error("a sync request is already pending")]
    RequestPending,

    /// No response arrived within the configured window.
    #[error("no sync response within {0:?}")]
    RequestTimeout(Duration),
}

impl BrokerError {
    /// Returns `true` for malformed-payload errors, which are dropped
    /// rather than redelivered.
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse(_))
    }
}
