//! `BrokerChannel` trait — connection/queue/exchange abstraction over the
//! message broker.
//!
//! Consumption couples processing and acknowledgment: a message is
//! acknowledged only after its handler returns success, so unacknowledged
//! messages are redelivered (at-least-once) and every handler must be
//! idempotent. The one exception is a malformed payload: it is routed to
//! the error observers and acknowledged, because requeueing a poison
//! message would redeliver it forever.

use async_trait::async_trait;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::observers::ObserverHandle;

/// The shared all-to-all fanout exchange for worker messages. Each
/// participant binds its own queue to it.
pub const COMMUNICATION_EXCHANGE: &str = "communication";

/// The broadcast exchange for raw transaction batches.
pub const TRANSACTIONS_EXCHANGE: &str = "transactions";

/// Explicit connection state, observable so reconnection logic is testable
/// in isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connected.
    Idle,
    /// Transport established.
    Connected,
    /// Transport lost; reconnect in progress or given up.
    Failed,
}

/// Where a publish is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTarget {
    /// Directly to a named queue.
    Queue(String),
    /// To a fanout exchange; the broker copies to every bound queue.
    Exchange(String),
}

/// Emitted when the transport drops.
#[derive(Debug, Clone)]
pub struct DisconnectNotice {
    pub reason: String,
}

/// Emitted for isolated message-level failures (parse errors, exhausted
/// redeliveries).
#[derive(Debug, Clone)]
pub struct ErrorNotice {
    pub queue: String,
    pub reason: String,
}

/// A consumer callback. Must be idempotent; see module docs for the
/// acknowledgment contract.
#[async_trait]
pub trait ConsumeHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<(), BrokerError>;
}

/// Trait over the message broker transport.
///
/// Implementations include [`crate::memory::MemoryBroker`] and, behind the
/// `amqp` feature, [`crate::amqp::AmqpBroker`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Declare a fanout exchange. Idempotent.
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError>;

    /// Bind a queue to an exchange.
    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError>;

    /// Publish a payload. Fire-and-forget from the caller's perspective.
    async fn publish(
        &self,
        target: &PublishTarget,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError>;

    /// Attach a consumer to a queue. Runs until the channel is closed;
    /// survives reconnects where the backend supports them.
    ///
    /// Queue semantics: each message is delivered to exactly one of the
    /// queue's consumers. All-to-all delivery is built from a fanout
    /// exchange with one bound queue per participant, never from several
    /// consumers sharing a queue.
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumeHandler>,
    ) -> Result<(), BrokerError>;

    /// Current transport state.
    fn state(&self) -> ConnectionState;

    /// Observe transport-level disconnects.
    fn on_disconnect(&self) -> (ObserverHandle, mpsc::UnboundedReceiver<DisconnectNotice>);

    /// Observe isolated message-level failures.
    fn on_error(&self) -> (ObserverHandle, mpsc::UnboundedReceiver<ErrorNotice>);
}
