//! Filtered transaction-batch fanout.
//!
//! Watchers broadcast raw transaction batches on the transactions
//! exchange; each worker binds its own queue to the exchange and runs a
//! [`TransactionListener`] on it. An optional predicate narrows the batch
//! before observers see it — there is a single delivery path, so observers
//! never receive both the raw and the filtered copy of a batch.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{BrokerChannel, ConsumeHandler, PublishTarget, TRANSACTIONS_EXCHANGE};
use crate::envelope::{Transaction, TransactionBatch};
use crate::error::BrokerError;
use crate::observers::{ObserverHandle, ObserverSet};

type TxPredicate = Arc<dyn Fn(&Transaction) -> bool + Send + Sync>;

/// Per-worker consumer of the transactions exchange.
pub struct TransactionListener {
    broker: Arc<dyn BrokerChannel>,
    queue: String,
    filter: Arc<Mutex<Option<TxPredicate>>>,
    batches: ObserverSet<TransactionBatch>,
}

impl TransactionListener {
    /// `worker` names this process; its private queue is
    /// `"{worker}.transactions"`.
    pub fn new(broker: Arc<dyn BrokerChannel>, worker: &str) -> Self {
        Self {
            broker,
            queue: format!("{worker}.transactions"),
            filter: Arc::new(Mutex::new(None)),
            batches: ObserverSet::new(),
        }
    }

    /// Declare the exchange, bind this worker's queue, and start consuming.
    pub async fn start(&self) -> Result<(), BrokerError> {
        self.broker.declare_exchange(TRANSACTIONS_EXCHANGE).await?;
        self.broker.declare_queue(&self.queue).await?;
        self.broker
            .bind_queue(&self.queue, TRANSACTIONS_EXCHANGE)
            .await?;
        self.broker
            .consume(
                &self.queue,
                Arc::new(ListenerConsumer {
                    queue: self.queue.clone(),
                    filter: self.filter.clone(),
                    batches: self.batches.clone(),
                }),
            )
            .await
    }

    /// Narrow future batches to transactions matching `predicate`.
    pub fn set_filter(&self, predicate: impl Fn(&Transaction) -> bool + Send + Sync + 'static) {
        *self.filter.lock().unwrap() = Some(Arc::new(predicate));
    }

    /// Remove the filter; observers see full batches again.
    pub fn clear_filter(&self) {
        *self.filter.lock().unwrap() = None;
    }

    /// Broadcast a batch to every bound worker queue.
    pub async fn broadcast(&self, batch: &TransactionBatch) -> Result<(), BrokerError> {
        let bytes = batch.to_bytes()?;
        self.broker
            .publish(
                &PublishTarget::Exchange(TRANSACTIONS_EXCHANGE.to_string()),
                &bytes,
                true,
            )
            .await
    }

    /// Observe incoming (filtered) batches.
    pub fn on_batch(&self) -> (ObserverHandle, mpsc::UnboundedReceiver<TransactionBatch>) {
        self.batches.subscribe()
    }
}

struct ListenerConsumer {
    queue: String,
    filter: Arc<Mutex<Option<TxPredicate>>>,
    batches: ObserverSet<TransactionBatch>,
}

#[async_trait]
impl ConsumeHandler for ListenerConsumer {
    async fn handle(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let mut batch = TransactionBatch::from_bytes(payload)?;
        let predicate = self.filter.lock().unwrap().clone();
        if let Some(predicate) = predicate {
            batch.transactions.retain(|tx| predicate(tx));
        }
        if batch.transactions.is_empty() {
            debug!(queue = %self.queue, "batch empty after filtering, skipped");
            return Ok(());
        }
        self.batches.emit(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    fn tx(hash: &str, amount: u64) -> Transaction {
        Transaction {
            hash: hash.into(),
            sender: "0xsender".into(),
            amount,
        }
    }

    #[tokio::test]
    async fn unfiltered_listener_sees_the_full_batch() {
        let broker = Arc::new(MemoryBroker::new());
        let listener = TransactionListener::new(broker.clone(), "worker-a");
        listener.start().await.unwrap();

        let (_h, mut rx) = listener.on_batch();
        listener
            .broadcast(&TransactionBatch {
                transactions: vec![tx("0x1", 50), tx("0x2", 500)],
            })
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap().transactions.len(), 2);
    }

    #[tokio::test]
    async fn filter_narrows_the_batch_once() {
        let broker = Arc::new(MemoryBroker::new());
        let listener = TransactionListener::new(broker.clone(), "worker-a");
        listener.start().await.unwrap();
        listener.set_filter(|tx| tx.amount > 100);

        let (_h, mut rx) = listener.on_batch();
        listener
            .broadcast(&TransactionBatch {
                transactions: vec![
                    tx("0x1", 50),
                    tx("0x2", 500),
                    tx("0x3", 100),
                    tx("0x4", 101),
                    tx("0x5", 7),
                ],
            })
            .await
            .unwrap();

        // One delivery, already filtered; never a second raw copy.
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.transactions.len(), 2);
        assert!(batch.transactions.iter().all(|t| t.amount > 100));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn batch_filtered_to_nothing_is_not_delivered() {
        let broker = Arc::new(MemoryBroker::new());
        let listener = TransactionListener::new(broker.clone(), "worker-a");
        listener.start().await.unwrap();
        listener.set_filter(|tx| tx.amount > 1_000_000);

        let (_h, mut rx) = listener.on_batch();
        listener
            .broadcast(&TransactionBatch {
                transactions: vec![tx("0x1", 50)],
            })
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_worker_queue_receives_the_broadcast() {
        let broker = Arc::new(MemoryBroker::new());
        let a = TransactionListener::new(broker.clone(), "worker-a");
        let b = TransactionListener::new(broker.clone(), "worker-b");
        a.start().await.unwrap();
        b.start().await.unwrap();
        b.set_filter(|tx| tx.amount >= 100);

        let (_ha, mut rx_a) = a.on_batch();
        let (_hb, mut rx_b) = b.on_batch();
        a.broadcast(&TransactionBatch {
            transactions: vec![tx("0x1", 50), tx("0x2", 500)],
        })
        .await
        .unwrap();

        assert_eq!(rx_a.try_recv().unwrap().transactions.len(), 2);
        assert_eq!(rx_b.try_recv().unwrap().transactions.len(), 1);
    }

    #[tokio::test]
    async fn clearing_the_filter_restores_full_batches() {
        let broker = Arc::new(MemoryBroker::new());
        let listener = TransactionListener::new(broker.clone(), "worker-a");
        listener.start().await.unwrap();
        listener.set_filter(|tx| tx.amount >= 100);
        listener.clear_filter();

        let (_h, mut rx) = listener.on_batch();
        listener
            .broadcast(&TransactionBatch {
                transactions: vec![tx("0x1", 50)],
            })
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap().transactions.len(), 1);
    }
}
