//! Single-flight request/response routing over worker queues.
//!
//! Each worker owns a queue named after itself and runs one [`SyncRouter`]
//! on it. A request is published to the recipient's queue; the matching
//! response comes back on the initiator's queue. At most one request may be
//! outstanding per router: a second `request` while one is pending is
//! rejected with [`BrokerError::RequestPending`] instead of silently
//! replacing the first caller's completion slot.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, warn};

use crate::channel::{BrokerChannel, ConsumeHandler, PublishTarget};
use crate::envelope::{EnvelopeKind, SyncEnvelope, SyncPayload};
use crate::error::BrokerError;
use crate::observers::{ObserverHandle, ObserverSet};

/// Default window a caller waits for a sync response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// This worker's queue name; used as the initiator on outgoing
    /// requests and as the consume queue.
    pub worker: String,
    /// How long `request` waits before giving up and clearing the
    /// pending slot.
    pub response_timeout: Duration,
}

impl RouterConfig {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

struct PendingRequest {
    kind: String,
    tx: oneshot::Sender<SyncPayload>,
}

/// Request/response mediator for one worker queue.
pub struct SyncRouter {
    broker: Arc<dyn BrokerChannel>,
    config: RouterConfig,
    pending: Arc<Mutex<Option<PendingRequest>>>,
    requests: ObserverSet<SyncEnvelope>,
    responses: ObserverSet<SyncEnvelope>,
}

impl SyncRouter {
    pub fn new(broker: Arc<dyn BrokerChannel>, config: RouterConfig) -> Self {
        Self {
            broker,
            config,
            pending: Arc::new(Mutex::new(None)),
            requests: ObserverSet::new(),
            responses: ObserverSet::new(),
        }
    }

    /// Declare this worker's queue and start consuming envelopes on it.
    pub async fn start(&self) -> Result<(), BrokerError> {
        self.broker.declare_queue(&self.config.worker).await?;
        self.broker
            .consume(
                &self.config.worker,
                Arc::new(RouterConsumer {
                    worker: self.config.worker.clone(),
                    pending: self.pending.clone(),
                    requests: self.requests.clone(),
                    responses: self.responses.clone(),
                }),
            )
            .await
    }

    /// Send `payload` to `recipient` and wait for the matching response.
    ///
    /// Fails immediately with [`BrokerError::RequestPending`] if another
    /// request is already in flight on this router. Times out with
    /// [`BrokerError::RequestTimeout`] after the configured window, at
    /// which point the pending slot is cleared and a late response will
    /// be dropped as stray.
    pub async fn request(
        &self,
        recipient: &str,
        payload: SyncPayload,
    ) -> Result<SyncPayload, BrokerError> {
        let rx = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_some() {
                return Err(BrokerError::RequestPending);
            }
            let (tx, rx) = oneshot::channel();
            *pending = Some(PendingRequest {
                kind: payload.kind.clone(),
                tx,
            });
            rx
        };

        let envelope = SyncEnvelope {
            kind: EnvelopeKind::Request,
            initiator: self.config.worker.clone(),
            recipient: recipient.to_string(),
            payload,
        };
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.clear_pending();
                return Err(e);
            }
        };
        if let Err(e) = self
            .broker
            .publish(&PublishTarget::Queue(recipient.to_string()), &bytes, true)
            .await
        {
            self.clear_pending();
            return Err(e);
        }

        match time::timeout(self.config.response_timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => {
                self.clear_pending();
                Err(BrokerError::Consume("response channel closed".into()))
            }
            Err(_) => {
                self.clear_pending();
                Err(BrokerError::RequestTimeout(self.config.response_timeout))
            }
        }
    }

    /// Answer a received request. The response is addressed back to the
    /// request's initiator queue.
    pub async fn respond(
        &self,
        request: &SyncEnvelope,
        payload: SyncPayload,
    ) -> Result<(), BrokerError> {
        let envelope = SyncEnvelope {
            kind: EnvelopeKind::Response,
            initiator: self.config.worker.clone(),
            recipient: request.initiator.clone(),
            payload,
        };
        let bytes = envelope.to_bytes()?;
        self.broker
            .publish(
                &PublishTarget::Queue(request.initiator.clone()),
                &bytes,
                true,
            )
            .await
    }

    /// Observe incoming request envelopes addressed to this worker.
    pub fn on_request(&self) -> (ObserverHandle, mpsc::UnboundedReceiver<SyncEnvelope>) {
        self.requests.subscribe()
    }

    /// Observe incoming response envelopes (after they complete a pending
    /// request).
    pub fn on_response(&self) -> (ObserverHandle, mpsc::UnboundedReceiver<SyncEnvelope>) {
        self.responses.subscribe()
    }

    fn clear_pending(&self) {
        *self.pending.lock().unwrap() = None;
    }
}

struct RouterConsumer {
    worker: String,
    pending: Arc<Mutex<Option<PendingRequest>>>,
    requests: ObserverSet<SyncEnvelope>,
    responses: ObserverSet<SyncEnvelope>,
}

#[async_trait]
impl ConsumeHandler for RouterConsumer {
    async fn handle(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let envelope = SyncEnvelope::from_bytes(payload)?;
        if envelope.recipient != self.worker {
            warn!(
                worker = %self.worker,
                recipient = %envelope.recipient,
                "dropping misaddressed envelope"
            );
            return Ok(());
        }
        match envelope.kind {
            EnvelopeKind::Request => {
                self.requests.emit(envelope);
            }
            EnvelopeKind::Response => {
                let pending = self.pending.lock().unwrap().take();
                match pending {
                    Some(p) => {
                        if p.kind != envelope.payload.kind {
                            warn!(
                                expected = %p.kind,
                                got = %envelope.payload.kind,
                                "response payload kind differs from request"
                            );
                        }
                        self.responses.emit(envelope.clone());
                        let _ = p.tx.send(envelope.payload);
                    }
                    None => {
                        debug!(
                            worker = %self.worker,
                            kind = %envelope.payload.kind,
                            "dropping stray response with no pending request"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
