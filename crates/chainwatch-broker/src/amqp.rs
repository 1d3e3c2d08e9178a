//! AMQP broker backend over `lapin`.
//!
//! The initial `connect` is fatal on failure — startup errors surface to the
//! process supervisor. After that, a background supervisor task owns the
//! connection: when the transport drops it notifies the disconnect
//! observers and reconnects with bounded exponential backoff, re-declaring
//! the recorded topology and respawning every consumer before flipping the
//! state back to `Connected`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{mpsc, RwLock};
use tokio::time;
use tracing::{error, info, warn};

use crate::channel::{
    BrokerChannel, ConnectionState, ConsumeHandler, DisconnectNotice, ErrorNotice, PublishTarget,
};
use crate::error::BrokerError;
use crate::observers::{ObserverHandle, ObserverSet};

/// Configuration for the AMQP backend.
#[derive(Debug, Clone)]
pub struct AmqpConfig {
    /// Reconnect backoff starting duration.
    pub reconnect_initial: Duration,
    /// Maximum reconnect backoff.
    pub reconnect_max: Duration,
    /// Reconnect attempt cap; `None` retries indefinitely.
    pub max_attempts: Option<u32>,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

/// Declared queues/exchanges/bindings, replayed after a reconnect.
#[derive(Default, Clone)]
struct Topology {
    queues: Vec<String>,
    exchanges: Vec<String>,
    bindings: Vec<(String, String)>,
}

impl Topology {
    fn record_queue(&mut self, name: &str) {
        if !self.queues.iter().any(|q| q == name) {
            self.queues.push(name.to_string());
        }
    }

    fn record_exchange(&mut self, name: &str) {
        if !self.exchanges.iter().any(|e| e == name) {
            self.exchanges.push(name.to_string());
        }
    }

    fn record_binding(&mut self, queue: &str, exchange: &str) {
        let pair = (queue.to_string(), exchange.to_string());
        if !self.bindings.contains(&pair) {
            self.bindings.push(pair);
        }
    }
}

struct ConsumerSpec {
    queue: String,
    handler: Arc<dyn ConsumeHandler>,
}

struct Inner {
    uri: String,
    config: AmqpConfig,
    channel: RwLock<Option<Channel>>,
    state: Mutex<ConnectionState>,
    topology: Mutex<Topology>,
    consumers: Mutex<Vec<ConsumerSpec>>,
    disconnects: ObserverSet<DisconnectNotice>,
    errors: ObserverSet<ErrorNotice>,
    reconnect_tx: mpsc::UnboundedSender<String>,
}

/// AMQP 0.9.1 broker channel.
#[derive(Clone)]
pub struct AmqpBroker {
    inner: Arc<Inner>,
}

impl AmqpBroker {
    /// Connect to the broker and start the reconnect supervisor.
    ///
    /// A failure here is fatal; it is not retried internally.
    pub async fn connect(
        uri: impl Into<String>,
        config: AmqpConfig,
    ) -> Result<Self, BrokerError> {
        let uri = uri.into();
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();

        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        install_error_hook(&connection, reconnect_tx.clone());

        let inner = Arc::new(Inner {
            uri,
            config,
            channel: RwLock::new(Some(channel)),
            state: Mutex::new(ConnectionState::Connected),
            topology: Mutex::new(Topology::default()),
            consumers: Mutex::new(Vec::new()),
            disconnects: ObserverSet::new(),
            errors: ObserverSet::new(),
            reconnect_tx,
        });

        tokio::spawn(supervise(inner.clone(), connection, reconnect_rx));
        info!("broker connected");
        Ok(Self { inner })
    }

    async fn channel(&self) -> Result<Channel, BrokerError> {
        self.inner
            .channel
            .read()
            .await
            .clone()
            .ok_or(BrokerError::NotConnected)
    }
}

fn install_error_hook(connection: &Connection, tx: mpsc::UnboundedSender<String>) {
    connection.on_error(move |e| {
        let _ = tx.send(e.to_string());
    });
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// One attempt at re-establishing the transport and restoring state on it.
/// The seam keeps the backoff loop testable without a live broker.
#[async_trait]
trait Redial: Send + Sync {
    async fn dial(&self) -> Result<(), BrokerError>;
}

/// Drive `dial` with exponential backoff until it succeeds, or until the
/// configured attempt cap is exhausted (returns `false`).
async fn retry_with_backoff(config: &AmqpConfig, dial: &dyn Redial) -> bool {
    let mut backoff = config.reconnect_initial;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if let Some(max) = config.max_attempts {
            if attempt > max {
                return false;
            }
        }

        time::sleep(backoff).await;
        match dial.dial().await {
            Ok(()) => return true,
            Err(e) => {
                warn!(attempt, error = %e, "reconnect failed, retrying in {backoff:?}");
                backoff = next_backoff(backoff, config.reconnect_max);
            }
        }
    }
}

/// Where the recorded topology is re-declared. Implemented by the live
/// channel and by a recording fake in tests.
#[async_trait]
trait TopologySink: Send + Sync {
    async fn queue(&self, name: &str) -> Result<(), BrokerError>;
    async fn exchange(&self, name: &str) -> Result<(), BrokerError>;
    async fn bind(&self, queue: &str, exchange: &str) -> Result<(), BrokerError>;
}

/// Re-declare a topology snapshot: queues and exchanges first, then the
/// bindings between them.
async fn replay_topology(topology: &Topology, sink: &dyn TopologySink) -> Result<(), BrokerError> {
    for queue in &topology.queues {
        sink.queue(queue).await?;
    }
    for exchange in &topology.exchanges {
        sink.exchange(exchange).await?;
    }
    for (queue, exchange) in &topology.bindings {
        sink.bind(queue, exchange).await?;
    }
    Ok(())
}

struct ChannelSink<'a>(&'a Channel);

#[async_trait]
impl TopologySink for ChannelSink<'_> {
    async fn queue(&self, name: &str) -> Result<(), BrokerError> {
        declare_queue_on(self.0, name).await
    }

    async fn exchange(&self, name: &str) -> Result<(), BrokerError> {
        declare_exchange_on(self.0, name).await
    }

    async fn bind(&self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        bind_queue_on(self.0, queue, exchange).await
    }
}

/// Dials the real transport and restores topology, consumers, and the
/// shared channel slot on success.
struct LapinRedial {
    inner: Arc<Inner>,
    established: Mutex<Option<Connection>>,
}

#[async_trait]
impl Redial for LapinRedial {
    async fn dial(&self) -> Result<(), BrokerError> {
        let connection = Connection::connect(&self.inner.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = restore(&self.inner, &connection).await?;
        install_error_hook(&connection, self.inner.reconnect_tx.clone());
        *self.inner.channel.write().await = Some(channel);
        *self.established.lock().unwrap() = Some(connection);
        Ok(())
    }
}

/// Background task owning the connection lifecycle.
async fn supervise(
    inner: Arc<Inner>,
    connection: Connection,
    mut reconnect_rx: mpsc::UnboundedReceiver<String>,
) {
    // Hold the live connection so it is not dropped while in use.
    let mut _current = Some(connection);

    while let Some(reason) = reconnect_rx.recv().await {
        *inner.state.lock().unwrap() = ConnectionState::Failed;
        *inner.channel.write().await = None;
        inner.disconnects.emit(DisconnectNotice {
            reason: reason.clone(),
        });
        warn!(reason = %reason, "broker connection lost, reconnecting");

        let redial = LapinRedial {
            inner: inner.clone(),
            established: Mutex::new(None),
        };
        if !retry_with_backoff(&inner.config, &redial).await {
            error!("broker reconnect attempts exhausted");
            inner.errors.emit(ErrorNotice {
                queue: String::new(),
                reason: "reconnect attempts exhausted".into(),
            });
            return;
        }

        *inner.state.lock().unwrap() = ConnectionState::Connected;
        _current = redial.established.lock().unwrap().take();
        info!("broker reconnected");
    }
}

/// Re-declare the recorded topology and respawn consumers on a fresh
/// channel.
async fn restore(inner: &Arc<Inner>, connection: &Connection) -> Result<Channel, BrokerError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

    let snapshot = inner.topology.lock().unwrap().clone();
    replay_topology(&snapshot, &ChannelSink(&channel)).await?;

    let specs: Vec<(String, Arc<dyn ConsumeHandler>)> = inner
        .consumers
        .lock()
        .unwrap()
        .iter()
        .map(|s| (s.queue.clone(), s.handler.clone()))
        .collect();
    for (queue, handler) in specs {
        start_consumer(inner.clone(), channel.clone(), queue, handler).await?;
    }

    Ok(channel)
}

async fn declare_queue_on(channel: &Channel, name: &str) -> Result<(), BrokerError> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Consume(e.to_string()))?;
    Ok(())
}

async fn declare_exchange_on(channel: &Channel, name: &str) -> Result<(), BrokerError> {
    channel
        .exchange_declare(
            name,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Consume(e.to_string()))?;
    Ok(())
}

async fn bind_queue_on(channel: &Channel, queue: &str, exchange: &str) -> Result<(), BrokerError> {
    channel
        .queue_bind(
            queue,
            exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Consume(e.to_string()))?;
    Ok(())
}

/// Attach a consumer and run its delivery loop in a background task.
///
/// The loop ends when the channel dies; the supervisor respawns it on the
/// next successful reconnect.
async fn start_consumer(
    inner: Arc<Inner>,
    channel: Channel,
    queue: String,
    handler: Arc<dyn ConsumeHandler>,
) -> Result<(), BrokerError> {
    let mut consumer = channel
        .basic_consume(
            &queue,
            "",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Consume(e.to_string()))?;

    let errors = inner.errors.clone();
    tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(d) => d,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "consumer stream error");
                    break;
                }
            };
            match handler.handle(&delivery.data).await {
                Ok(()) => {
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        warn!(queue = %queue, error = %e, "ack failed");
                        break;
                    }
                }
                Err(e) if e.is_parse() => {
                    // Poison message: report and drop instead of requeueing
                    // it forever.
                    errors.emit(ErrorNotice {
                        queue: queue.clone(),
                        reason: e.to_string(),
                    });
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "handler failed, message requeued");
                    let _ = delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await;
                }
            }
        }
    });
    Ok(())
}

#[async_trait]
impl BrokerChannel for AmqpBroker {
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        declare_queue_on(&channel, name).await?;
        self.inner.topology.lock().unwrap().record_queue(name);
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        declare_exchange_on(&channel, name).await?;
        self.inner.topology.lock().unwrap().record_exchange(name);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        bind_queue_on(&channel, queue, exchange).await?;
        self.inner
            .topology
            .lock()
            .unwrap()
            .record_binding(queue, exchange);
        Ok(())
    }

    async fn publish(
        &self,
        target: &PublishTarget,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        let (exchange, routing_key) = match target {
            PublishTarget::Queue(queue) => ("", queue.as_str()),
            PublishTarget::Exchange(exchange) => (exchange.as_str(), ""),
        };
        let properties = if persistent {
            BasicProperties::default().with_delivery_mode(2)
        } else {
            BasicProperties::default()
        };
        // Fire-and-forget: the publisher confirm is not awaited.
        let _confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumeHandler>,
    ) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        self.inner.consumers.lock().unwrap().push(ConsumerSpec {
            queue: queue.to_string(),
            handler: handler.clone(),
        });
        start_consumer(self.inner.clone(), channel, queue.to_string(), handler).await
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
