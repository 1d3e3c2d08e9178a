//! All-to-all worker messaging over the shared communication exchange.
//!
//! Every worker binds its own durable queue to the fanout exchange, so the
//! broker copies each published message into every participant's queue —
//! including the sender's. Competing consumers on one shared queue would
//! round-robin instead; the per-worker queue is what makes the delivery
//! all-to-all across processes. Recipients self-filter by
//! [`WorkerMessage::kind`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::{BrokerChannel, ConsumeHandler, PublishTarget, COMMUNICATION_EXCHANGE};
use crate::envelope::WorkerMessage;
use crate::error::BrokerError;
use crate::observers::{ObserverHandle, ObserverSet};

/// Fanout bus over [`COMMUNICATION_EXCHANGE`].
pub struct FanoutBus {
    broker: Arc<dyn BrokerChannel>,
    queue: String,
    messages: ObserverSet<WorkerMessage>,
}

impl FanoutBus {
    /// `worker` names this process; its private queue is
    /// `"{worker}.communication"`.
    pub fn new(broker: Arc<dyn BrokerChannel>, worker: &str) -> Self {
        Self {
            broker,
            queue: format!("{worker}.communication"),
            messages: ObserverSet::new(),
        }
    }

    /// Declare the exchange, bind this worker's queue, and start consuming.
    pub async fn start(&self) -> Result<(), BrokerError> {
        self.broker.declare_exchange(COMMUNICATION_EXCHANGE).await?;
        self.broker.declare_queue(&self.queue).await?;
        self.broker
            .bind_queue(&self.queue, COMMUNICATION_EXCHANGE)
            .await?;
        self.broker
            .consume(
                &self.queue,
                Arc::new(BusConsumer {
                    messages: self.messages.clone(),
                }),
            )
            .await
    }

    /// Broadcast a message to every worker on the bus.
    pub async fn publish(&self, message: &WorkerMessage) -> Result<(), BrokerError> {
        let bytes = message.to_bytes()?;
        self.broker
            .publish(
                &PublishTarget::Exchange(COMMUNICATION_EXCHANGE.to_string()),
                &bytes,
                true,
            )
            .await
    }

    /// Observe incoming bus messages.
    pub fn on_message(&self) -> (ObserverHandle, mpsc::UnboundedReceiver<WorkerMessage>) {
        self.messages.subscribe()
    }
}

struct BusConsumer {
    messages: ObserverSet<WorkerMessage>,
}

#[async_trait]
impl ConsumeHandler for BusConsumer {
    async fn handle(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let message = WorkerMessage::from_bytes(payload)?;
        self.messages.emit(message);
        Ok(())
    }
}
