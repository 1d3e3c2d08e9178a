//! The Watcher — orchestrates backfill-then-live ingestion for one contract
//! domain.
//!
//! # Phase 1: BACKFILL
//! Pull every event in `[cursor, head]` from the source, dispatch them
//! sequentially (each handler awaited before the next — downstream status
//! transitions assume causal order), advancing the cursor after every
//! successfully handled event.
//!
//! # Phase 2: LIVE
//! Consume the push subscription through the same handlers. Live delivery
//! may overlap with backfill; the idempotent record store makes the overlap
//! harmless.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cursor::CursorStore;
use crate::error::WatchError;
use crate::handler::HandlerRegistry;
use crate::source::{ChainEventSource, EventStream};
use crate::types::{BlockPosition, ChainEvent, Network, WatchContext, WatchPhase};

/// Configuration for one watcher instance.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Watcher identifier, used in logs.
    pub id: String,
    /// Network to ingest from.
    pub network: Network,
    /// Starting position used when no cursor exists yet.
    pub floor: BlockPosition,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            network: Network::from("mainnet"),
            floor: 0,
        }
    }
}

/// Status emitted by the watcher for observability.
#[derive(Debug)]
pub enum WatcherEvent {
    BackfillProgress {
        position: BlockPosition,
        target: BlockPosition,
    },
    BackfillComplete {
        at_position: BlockPosition,
    },
    LiveEvent {
        position: BlockPosition,
    },
    HandlerFailed {
        position: BlockPosition,
        reason: String,
    },
}

/// Per-contract-domain orchestrator combining backfill and live ingestion
/// through a shared handler registry.
pub struct Watcher {
    config: WatcherConfig,
    source: Arc<dyn ChainEventSource>,
    cursors: Arc<dyn CursorStore>,
    registry: HandlerRegistry,
    subscribed: bool,
    status_tx: Option<mpsc::UnboundedSender<WatcherEvent>>,
}

impl Watcher {
    pub fn new(
        config: WatcherConfig,
        source: Arc<dyn ChainEventSource>,
        cursors: Arc<dyn CursorStore>,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            config,
            source,
            cursors,
            registry,
            subscribed: false,
            status_tx: None,
        }
    }

    /// Open the observability channel. Call before `run()`.
    pub fn status_events(&mut self) -> mpsc::UnboundedReceiver<WatcherEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.status_tx = Some(tx);
        rx
    }

    fn emit(&self, event: WatcherEvent) {
        if let Some(tx) = &self.status_tx {
            let _ = tx.send(event);
        }
    }

    /// Advance the cursor, never backwards. Live pushes can arrive for
    /// blocks still being backfilled; a stale position is ignored.
    async fn advance_cursor(&self, position: BlockPosition) -> Result<(), WatchError> {
        let current = self.cursors.get(&self.config.network).await?;
        if current.map_or(true, |c| position > c) {
            self.cursors.set(&self.config.network, position).await?;
        }
        Ok(())
    }

    /// Pull and process every event in `[from, head]`.
    ///
    /// Events are dispatched sequentially; a handler failure aborts the
    /// remaining batch, leaving the cursor at the last event strictly before
    /// the failing one. When the source reports a truncated range the cursor
    /// is still advanced to the range end (best-effort forward progress) and
    /// only then does the call fail with `IncompleteBackfill`, so a retry
    /// resumes past already-applied work.
    pub async fn collect_uncollected_events(
        &self,
        from: BlockPosition,
    ) -> Result<BlockPosition, WatchError> {
        let backlog = self.source.collect_from(from).await?;
        let target = backlog.last_position;
        info!(
            watcher = %self.config.id,
            from,
            target,
            events = backlog.events.len(),
            complete = backlog.is_complete,
            "collected backlog"
        );

        let ctx = WatchContext {
            network: self.config.network.clone(),
            phase: WatchPhase::Backfill,
        };

        for raw in &backlog.events {
            let Some(event) = ChainEvent::decode(raw) else {
                // Not part of this domain's closed event set.
                continue;
            };
            if let Err(e) = self.registry.dispatch(&event, &ctx).await {
                let last = self.cursors.get(&self.config.network).await?.unwrap_or(from);
                error!(
                    watcher = %self.config.id,
                    position = event.block_position,
                    last_processed = last,
                    error = %e,
                    "backfill aborted by handler failure"
                );
                return Err(e);
            }
            self.advance_cursor(event.block_position).await?;
            self.emit(WatcherEvent::BackfillProgress {
                position: event.block_position,
                target,
            });
        }

        self.advance_cursor(target).await?;

        if !backlog.is_complete {
            warn!(
                watcher = %self.config.id,
                last_position = target,
                "source returned a truncated range"
            );
            return Err(WatchError::IncompleteBackfill {
                last_position: target,
            });
        }

        self.emit(WatcherEvent::BackfillComplete {
            at_position: target,
        });
        Ok(target)
    }

    /// Register the live push subscription. Allowed once per process
    /// lifetime; a second call is rejected.
    pub async fn subscribe_on_events(&mut self) -> Result<EventStream, WatchError> {
        if self.subscribed {
            return Err(WatchError::AlreadySubscribed);
        }
        let stream = self.source.subscribe().await?;
        self.subscribed = true;
        Ok(stream)
    }

    /// Run the watcher: resume the cursor, drain the backlog (retrying
    /// truncated ranges from the advanced cursor), then follow the live
    /// subscription until the source closes the stream.
    pub async fn run(&mut self) -> Result<(), WatchError> {
        let mut from = self
            .cursors
            .create_if_absent(&self.config.network, self.config.floor)
            .await?;
        info!(watcher = %self.config.id, network = %self.config.network, from, "starting backfill");

        loop {
            match self.collect_uncollected_events(from).await {
                Ok(position) => {
                    info!(watcher = %self.config.id, at = position, "backfill complete");
                    break;
                }
                Err(WatchError::IncompleteBackfill { last_position }) => {
                    from = last_position;
                }
                Err(e) => return Err(e),
            }
        }

        let mut stream = self.subscribe_on_events().await?;
        let ctx = WatchContext {
            network: self.config.network.clone(),
            phase: WatchPhase::Live,
        };

        while let Some(raw) = stream.recv().await {
            let Some(event) = ChainEvent::decode(&raw) else {
                continue;
            };
            match self.registry.dispatch(&event, &ctx).await {
                Ok(()) => {
                    self.advance_cursor(event.block_position).await?;
                    self.emit(WatcherEvent::LiveEvent {
                        position: event.block_position,
                    });
                }
                Err(e) => {
                    // The source redelivers after reconnects and creates are
                    // idempotent, so skipping is safe here.
                    let last = self
                        .cursors
                        .get(&self.config.network)
                        .await?
                        .unwrap_or(self.config.floor);
                    error!(
                        watcher = %self.config.id,
                        position = event.block_position,
                        last_processed = last,
                        error = %e,
                        "live handler failed, skipping event"
                    );
                    self.emit(WatcherEvent::HandlerFailed {
                        position: event.block_position,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(watcher = %self.config.id, "live stream closed");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
