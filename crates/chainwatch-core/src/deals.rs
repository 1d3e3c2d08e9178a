//! Deal domain — the related entity whose status advances on first-create.
//!
//! Each handler follows the same contract: stamp the event with its block
//! timestamp, create-if-absent on the record store keyed by
//! `(tx_hash, network)`, and run the status side effect only when the row
//! was newly inserted. On replay the handler returns success without side
//! effects, which is what lets the watcher advance the cursor past
//! redelivered events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::WatchError;
use crate::handler::EventHandler;
use crate::record::{EventRecord, EventRecordStore};
use crate::source::ChainEventSource;
use crate::types::{ChainEvent, EventKind, WatchContext};

// ─── Deal entity ─────────────────────────────────────────────────────────────

/// Lifecycle status of a deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Pending,
    Active,
    Closed,
}

impl std::fmt::Display for DealStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A deal row, looked up by its on-chain nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub nonce: String,
    pub status: DealStatus,
}

/// Trait for the deal table consumed by handlers.
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn find_by_nonce(&self, nonce: &str) -> Result<Option<Deal>, WatchError>;

    /// Create a pending deal if absent; returns `true` when newly created.
    async fn create_pending(&self, nonce: &str) -> Result<bool, WatchError>;

    async fn set_status(&self, nonce: &str, status: DealStatus) -> Result<(), WatchError>;
}

// ─── Record helper ───────────────────────────────────────────────────────────

/// Stamp and persist an event record, returning whether it was newly
/// created. This is the shared front half of every handler.
pub async fn record_event(
    records: &dyn EventRecordStore,
    source: &dyn ChainEventSource,
    event: &ChainEvent,
    ctx: &WatchContext,
) -> Result<bool, WatchError> {
    let header = source.block_header(event.block_position).await?;
    let record = EventRecord {
        tx_hash: event.tx_hash.clone(),
        network: ctx.network.clone(),
        kind: event.payload.kind().to_string(),
        fields: serde_json::json!({ "nonce": event.payload.nonce() }),
        block_position: event.block_position,
        timestamp: header.timestamp,
    };
    let (_, created) = records.create_if_absent(record).await?;
    if !created {
        debug!(
            tx_hash = %event.tx_hash,
            network = %ctx.network,
            "event already recorded, skipping side effects"
        );
    }
    Ok(created)
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// Records `DealRegistered` events and creates the pending deal row.
pub struct DealRegisteredHandler {
    pub records: Arc<dyn EventRecordStore>,
    pub deals: Arc<dyn DealStore>,
    pub source: Arc<dyn ChainEventSource>,
}

#[async_trait]
impl EventHandler for DealRegisteredHandler {
    async fn handle(&self, event: &ChainEvent, ctx: &WatchContext) -> Result<(), WatchError> {
        let created = record_event(&*self.records, &*self.source, event, ctx).await?;
        if created {
            self.deals.create_pending(event.payload.nonce()).await?;
        }
        Ok(())
    }

    fn kind(&self) -> EventKind {
        EventKind::DealRegistered
    }
}

/// Records `DealActivated` events and advances the referenced pending deal
/// to active — exactly once, gated by the newly-created flag.
pub struct DealActivatedHandler {
    pub records: Arc<dyn EventRecordStore>,
    pub deals: Arc<dyn DealStore>,
    pub source: Arc<dyn ChainEventSource>,
}

#[async_trait]
impl EventHandler for DealActivatedHandler {
    async fn handle(&self, event: &ChainEvent, ctx: &WatchContext) -> Result<(), WatchError> {
        let created = record_event(&*self.records, &*self.source, event, ctx).await?;
        if created {
            let nonce = event.payload.nonce();
            if let Some(deal) = self.deals.find_by_nonce(nonce).await? {
                if deal.status == DealStatus::Pending {
                    self.deals.set_status(nonce, DealStatus::Active).await?;
                }
            }
        }
        Ok(())
    }

    fn kind(&self) -> EventKind {
        EventKind::DealActivated
    }
}

/// Records `DealClosed` events and closes the referenced deal.
pub struct DealClosedHandler {
    pub records: Arc<dyn EventRecordStore>,
    pub deals: Arc<dyn DealStore>,
    pub source: Arc<dyn ChainEventSource>,
}

#[async_trait]
impl EventHandler for DealClosedHandler {
    async fn handle(&self, event: &ChainEvent, ctx: &WatchContext) -> Result<(), WatchError> {
        let created = record_event(&*self.records, &*self.source, event, ctx).await?;
        if created {
            self.deals
                .set_status(event.payload.nonce(), DealStatus::Closed)
                .await?;
        }
        Ok(())
    }

    fn kind(&self) -> EventKind {
        EventKind::DealClosed
    }
}

// ─── In-memory store (for tests) ─────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory deal store for tests.
#[derive(Default)]
pub struct MemoryDealStore {
    rows: Mutex<HashMap<String, Deal>>,
}

impl MemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a deal directly (test setup).
    pub fn insert(&self, deal: Deal) {
        self.rows.lock().unwrap().insert(deal.nonce.clone(), deal);
    }
}

#[async_trait]
impl DealStore for MemoryDealStore {
    async fn find_by_nonce(&self, nonce: &str) -> Result<Option<Deal>, WatchError> {
        Ok(self.rows.lock().unwrap().get(nonce).cloned())
    }

    async fn create_pending(&self, nonce: &str) -> Result<bool, WatchError> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(nonce) {
            return Ok(false);
        }
        rows.insert(
            nonce.to_string(),
            Deal {
                nonce: nonce.to_string(),
                status: DealStatus::Pending,
            },
        );
        Ok(true)
    }

    async fn set_status(&self, nonce: &str, status: DealStatus) -> Result<(), WatchError> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(nonce) {
            Some(deal) => {
                deal.status = status;
                Ok(())
            }
            None => Err(WatchError::Storage(format!("no deal with nonce {nonce}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockPosition, EventPayload, Network, WatchPhase};
    use crate::record::MemoryRecordStore;
    use crate::source::{Backlog, BlockHeader, EventStream};

    struct FixedClockSource;

    #[async_trait]
    impl ChainEventSource for FixedClockSource {
        async fn subscribe(&self) -> Result<EventStream, WatchError> {
            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            Ok(rx)
        }

        async fn collect_from(&self, from: BlockPosition) -> Result<Backlog, WatchError> {
            Ok(Backlog {
                events: vec![],
                is_complete: true,
                last_position: from,
            })
        }

        async fn block_header(&self, position: BlockPosition) -> Result<BlockHeader, WatchError> {
            Ok(BlockHeader {
                position,
                timestamp: 1_700_000_000 + position as i64,
            })
        }
    }

    fn activated(tx: &str, nonce: &str, position: BlockPosition) -> ChainEvent {
        ChainEvent {
            tx_hash: tx.to_string(),
            block_position: position,
            payload: EventPayload::DealActivated {
                nonce: nonce.to_string(),
            },
        }
    }

    fn ctx() -> WatchContext {
        WatchContext {
            network: Network::from("testnet"),
            phase: WatchPhase::Live,
        }
    }

    #[tokio::test]
    async fn duplicate_delivery_activates_once() {
        let records = Arc::new(MemoryRecordStore::new());
        let deals = Arc::new(MemoryDealStore::new());
        deals.insert(Deal {
            nonce: "5".into(),
            status: DealStatus::Pending,
        });

        let handler = DealActivatedHandler {
            records: records.clone(),
            deals: deals.clone(),
            source: Arc::new(FixedClockSource),
        };

        let event = activated("0xabc", "5", 100);
        let ctx = ctx();
        handler.handle(&event, &ctx).await.unwrap();
        handler.handle(&event, &ctx).await.unwrap();

        // Exactly one record, and the deal moved to active exactly once.
        assert_eq!(records.count().await.unwrap(), 1);
        let deal = deals.find_by_nonce("5").await.unwrap().unwrap();
        assert_eq!(deal.status, DealStatus::Active);

        // A replay after the deal closed must not resurrect it.
        deals.set_status("5", DealStatus::Closed).await.unwrap();
        handler.handle(&event, &ctx).await.unwrap();
        let deal = deals.find_by_nonce("5").await.unwrap().unwrap();
        assert_eq!(deal.status, DealStatus::Closed);
    }

    #[tokio::test]
    async fn activation_of_unknown_deal_records_without_effect() {
        let records = Arc::new(MemoryRecordStore::new());
        let deals = Arc::new(MemoryDealStore::new());
        let handler = DealActivatedHandler {
            records: records.clone(),
            deals: deals.clone(),
            source: Arc::new(FixedClockSource),
        };

        handler.handle(&activated("0x1", "404", 50), &ctx()).await.unwrap();

        assert_eq!(records.count().await.unwrap(), 1);
        assert!(deals.find_by_nonce("404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn registered_creates_pending_deal_once() {
        let records = Arc::new(MemoryRecordStore::new());
        let deals = Arc::new(MemoryDealStore::new());
        let handler = DealRegisteredHandler {
            records: records.clone(),
            deals: deals.clone(),
            source: Arc::new(FixedClockSource),
        };

        let event = ChainEvent {
            tx_hash: "0x2".into(),
            block_position: 10,
            payload: EventPayload::DealRegistered { nonce: "7".into() },
        };
        let ctx = ctx();
        handler.handle(&event, &ctx).await.unwrap();
        handler.handle(&event, &ctx).await.unwrap();

        let deal = deals.find_by_nonce("7").await.unwrap().unwrap();
        assert_eq!(deal.status, DealStatus::Pending);
        assert_eq!(records.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn record_carries_block_timestamp() {
        let records = Arc::new(MemoryRecordStore::new());
        let deals = Arc::new(MemoryDealStore::new());
        let handler = DealClosedHandler {
            records: records.clone(),
            deals: deals.clone(),
            source: Arc::new(FixedClockSource),
        };
        deals.insert(Deal {
            nonce: "9".into(),
            status: DealStatus::Active,
        });

        let event = ChainEvent {
            tx_hash: "0x3".into(),
            block_position: 42,
            payload: EventPayload::DealClosed { nonce: "9".into() },
        };
        handler.handle(&event, &ctx()).await.unwrap();

        let row = records
            .find("0x3", &Network::from("testnet"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.timestamp, 1_700_000_042);
        assert_eq!(row.kind, "deal_closed");
        assert_eq!(
            deals.find_by_nonce("9").await.unwrap().unwrap().status,
            DealStatus::Closed
        );
    }
}
