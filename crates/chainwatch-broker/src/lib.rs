//! chainwatch-broker — broker mediation between independently-deployed
//! watcher processes.
//!
//! # Architecture
//!
//! ```text
//! BrokerChannel (trait)
//!     ├── MemoryBroker   (RAM queues, tests / single-process)
//!     └── AmqpBroker     (lapin, feature `amqp`, backoff-retry reconnect)
//!
//! Built on the channel:
//!     ├── SyncRouter           (single-flight request/response)
//!     ├── FanoutBus            (all-to-all worker messages over a fanout
//!                               exchange, one queue per worker)
//!     ├── Notifier             (fire-and-forget external notifications)
//!     └── TransactionListener  (filtered transaction-batch fanout)
//! ```
//!
//! Delivery is at-least-once: a message is acknowledged only after its
//! handler completes, so every consumer handler must be idempotent.

pub mod channel;
pub mod envelope;
pub mod error;
pub mod fanout;
pub mod memory;
pub mod notify;
pub mod observers;
pub mod router;
pub mod tx_listener;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use channel::{
    BrokerChannel, ConnectionState, ConsumeHandler, DisconnectNotice, ErrorNotice, PublishTarget,
    COMMUNICATION_EXCHANGE, TRANSACTIONS_EXCHANGE,
};
pub use envelope::{
    EnvelopeKind, SyncEnvelope, SyncPayload, Transaction, TransactionBatch, WorkerMessage,
};
pub use error::BrokerError;
pub use fanout::FanoutBus;
pub use memory::{MemoryBroker, MemoryBrokerConfig};
pub use notify::{Notification, Notifier, NOTIFICATIONS_QUEUE};
pub use observers::{ObserverHandle, ObserverSet};
pub use router::{RouterConfig, SyncRouter};
pub use tx_listener::TransactionListener;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConfig};
