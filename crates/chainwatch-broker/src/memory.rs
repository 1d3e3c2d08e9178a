//! In-memory broker backend.
//!
//! Queues, fanout exchanges, and at-least-once redelivery in RAM. Used by
//! tests and single-process deployments; no persistence, no transport.
//!
//! Delivery semantics match the channel contract: a queue hands each
//! message to exactly one of its consumers (round-robin), an exchange
//! copies to every bound queue, a failed handler gets the message
//! redelivered up to `max_redeliveries` times, and a parse failure is
//! reported to the error observers and dropped.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::channel::{
    BrokerChannel, ConnectionState, ConsumeHandler, DisconnectNotice, ErrorNotice, PublishTarget,
};
use crate::error::BrokerError;
use crate::observers::{ObserverHandle, ObserverSet};

/// Tuning knobs for the in-memory backend.
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// How many times a failed delivery is retried before the message is
    /// dropped and reported.
    pub max_redeliveries: u32,
    /// Pause between redeliveries.
    pub redelivery_delay: Duration,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: 5,
            redelivery_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Default)]
struct QueueState {
    consumers: Vec<Arc<dyn ConsumeHandler>>,
    /// Round-robin pick for the next delivery.
    next_consumer: usize,
    /// Messages published before the first consumer attached.
    backlog: Vec<Vec<u8>>,
}

struct Inner {
    config: MemoryBrokerConfig,
    queues: Mutex<HashMap<String, QueueState>>,
    /// exchange name → bound queue names
    exchanges: Mutex<HashMap<String, Vec<String>>>,
    state: Mutex<ConnectionState>,
    disconnects: ObserverSet<DisconnectNotice>,
    errors: ObserverSet<ErrorNotice>,
}

/// In-memory message broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_config(MemoryBrokerConfig::default())
    }

    pub fn with_config(config: MemoryBrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                queues: Mutex::new(HashMap::new()),
                exchanges: Mutex::new(HashMap::new()),
                state: Mutex::new(ConnectionState::Connected),
                disconnects: ObserverSet::new(),
                errors: ObserverSet::new(),
            }),
        }
    }

    /// Simulate a transport drop (test hook for disconnect observers).
    pub fn inject_disconnect(&self, reason: impl Into<String>) {
        *self.inner.state.lock().unwrap() = ConnectionState::Failed;
        self.inner.disconnects.emit(DisconnectNotice {
            reason: reason.into(),
        });
    }

    /// Deliver `payload` to one handler, honoring the redelivery contract.
    async fn deliver(&self, queue: &str, handler: &Arc<dyn ConsumeHandler>, payload: &[u8]) {
        let max_attempts = self.inner.config.max_redeliveries.max(1);
        for attempt in 1..=max_attempts {
            match handler.handle(payload).await {
                Ok(()) => return,
                Err(e) if e.is_parse() => {
                    self.inner.errors.emit(ErrorNotice {
                        queue: queue.to_string(),
                        reason: e.to_string(),
                    });
                    return;
                }
                Err(e) => {
                    warn!(queue, attempt, error = %e, "handler failed, message unacknowledged");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.inner.config.redelivery_delay).await;
                    } else {
                        self.inner.errors.emit(ErrorNotice {
                            queue: queue.to_string(),
                            reason: format!("redeliveries exhausted: {e}"),
                        });
                    }
                }
            }
        }
    }

    async fn publish_to_queue(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let handler = {
            let mut queues = self.inner.queues.lock().unwrap();
            let state = queues.entry(queue.to_string()).or_default();
            if state.consumers.is_empty() {
                state.backlog.push(payload.to_vec());
                return Ok(());
            }
            let picked = state.consumers[state.next_consumer % state.consumers.len()].clone();
            state.next_consumer = state.next_consumer.wrapping_add(1);
            picked
        };

        self.deliver(queue, &handler, payload).await;
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryBroker {
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.inner
            .queues
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.inner
            .exchanges
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        self.declare_queue(queue).await?;
        let mut exchanges = self.inner.exchanges.lock().unwrap();
        let bound = exchanges.entry(exchange.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish(
        &self,
        target: &PublishTarget,
        payload: &[u8],
        _persistent: bool,
    ) -> Result<(), BrokerError> {
        match target {
            PublishTarget::Queue(queue) => self.publish_to_queue(queue, payload).await,
            PublishTarget::Exchange(exchange) => {
                let bound: Vec<String> = self
                    .inner
                    .exchanges
                    .lock()
                    .unwrap()
                    .get(exchange.as_str())
                    .cloned()
                    .unwrap_or_default();
                for queue in &bound {
                    self.publish_to_queue(queue, payload).await?;
                }
                Ok(())
            }
        }
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumeHandler>,
    ) -> Result<(), BrokerError> {
        let backlog: Vec<Vec<u8>> = {
            let mut queues = self.inner.queues.lock().unwrap();
            let state = queues.entry(queue.to_string()).or_default();
            state.consumers.push(handler.clone());
            std::mem::take(&mut state.backlog)
        };

        for payload in &backlog {
            self.deliver(queue, &handler, payload).await;
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    fn on_disconnect(&self) -> (ObserverHandle, mpsc::UnboundedReceiver<DisconnectNotice>) {
        self.inner.disconnects.subscribe()
    }

    fn on_error(&self) -> (ObserverHandle, mpsc::UnboundedReceiver<ErrorNotice>) {
        self.inner.errors.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recording {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(vec![]),
            })
        }
        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ConsumeHandler for Recording {
        async fn handle(&self, payload: &[u8]) -> Result<(), BrokerError> {
            self.seen.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn queue_delivers_each_message_to_one_consumer() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work").await.unwrap();

        let a = Recording::new();
        let b = Recording::new();
        broker.consume("work", a.clone()).await.unwrap();
        broker.consume("work", b.clone()).await.unwrap();

        for payload in [b"one".as_slice(), b"two", b"three", b"four"] {
            broker
                .publish(&PublishTarget::Queue("work".into()), payload, false)
                .await
                .unwrap();
        }

        // Round-robin: split between the competing consumers, no copies.
        assert_eq!(a.count(), 2);
        assert_eq!(b.count(), 2);
    }

    #[tokio::test]
    async fn messages_before_first_consumer_are_held() {
        let broker = MemoryBroker::new();
        broker
            .publish(&PublishTarget::Queue("q".into()), b"early", true)
            .await
            .unwrap();

        let h = Recording::new();
        broker.consume("q", h.clone()).await.unwrap();
        assert_eq!(h.count(), 1);
    }

    #[tokio::test]
    async fn exchange_copies_to_every_bound_queue() {
        let broker = MemoryBroker::new();
        broker.declare_exchange("transactions").await.unwrap();
        broker.bind_queue("a.transactions", "transactions").await.unwrap();
        broker.bind_queue("b.transactions", "transactions").await.unwrap();

        let a = Recording::new();
        let b = Recording::new();
        broker.consume("a.transactions", a.clone()).await.unwrap();
        broker.consume("b.transactions", b.clone()).await.unwrap();

        broker
            .publish(&PublishTarget::Exchange("transactions".into()), b"batch", false)
            .await
            .unwrap();

        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
    }

    #[tokio::test]
    async fn failed_handler_gets_redelivered_until_success() {
        struct FailTwice(AtomicU32);

        #[async_trait]
        impl ConsumeHandler for FailTwice {
            async fn handle(&self, _payload: &[u8]) -> Result<(), BrokerError> {
                let n = self.0.fetch_add(1, Ordering::Relaxed);
                if n < 2 {
                    Err(BrokerError::Handler("transient".into()))
                } else {
                    Ok(())
                }
            }
        }

        let broker = MemoryBroker::with_config(MemoryBrokerConfig {
            max_redeliveries: 5,
            redelivery_delay: Duration::from_millis(1),
        });
        let handler = Arc::new(FailTwice(AtomicU32::new(0)));
        broker.consume("q", handler.clone()).await.unwrap();

        broker
            .publish(&PublishTarget::Queue("q".into()), b"m", false)
            .await
            .unwrap();

        assert_eq!(handler.0.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn parse_failure_routes_to_error_observers_without_redelivery() {
        struct RejectsAll(AtomicU32);

        #[async_trait]
        impl ConsumeHandler for RejectsAll {
            async fn handle(&self, _payload: &[u8]) -> Result<(), BrokerError> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Err(BrokerError::Parse("bad json".into()))
            }
        }

        let broker = MemoryBroker::new();
        let (_h, mut errors) = broker.on_error();
        let handler = Arc::new(RejectsAll(AtomicU32::new(0)));
        broker.consume("q", handler.clone()).await.unwrap();

        broker
            .publish(&PublishTarget::Queue("q".into()), b"junk", false)
            .await
            .unwrap();

        // Exactly one attempt, one error notice.
        assert_eq!(handler.0.load(Ordering::Relaxed), 1);
        let notice = errors.try_recv().unwrap();
        assert_eq!(notice.queue, "q");
    }

    #[tokio::test]
    async fn disconnect_observers_are_notified() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.state(), ConnectionState::Connected);

        let (_h, mut rx) = broker.on_disconnect();
        broker.inject_disconnect("socket reset");

        assert_eq!(broker.state(), ConnectionState::Failed);
        assert_eq!(rx.try_recv().unwrap().reason, "socket reset");
    }
}
