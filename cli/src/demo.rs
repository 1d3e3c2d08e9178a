//! End-to-end in-memory demo: a scripted chain source, the deal handlers
//! over `InMemoryStorage`, and a notification queued on the in-memory
//! broker once backfill finishes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use chainwatch_broker::{MemoryBroker, Notification, Notifier};
use chainwatch_core::deals::{DealActivatedHandler, DealClosedHandler, DealRegisteredHandler};
use chainwatch_core::{
    Backlog, BlockHeader, BlockPosition, ChainEventSource, DealStore, EventRecordStore,
    EventStream, HandlerRegistry, RawEvent, WatchError, Watcher, WatcherBuilder,
};
use chainwatch_storage::InMemoryStorage;

/// A canned source: one backlog of deal events, then an already-closed
/// live stream so the watcher returns after backfill.
struct ScriptedSource;

fn raw(kind: &str, tx: &str, position: BlockPosition, nonce: &str) -> RawEvent {
    RawEvent {
        kind: kind.into(),
        tx_hash: tx.into(),
        block_position: position,
        fields: serde_json::json!({ "nonce": nonce }),
    }
}

#[async_trait]
impl ChainEventSource for ScriptedSource {
    async fn subscribe(&self) -> Result<EventStream, WatchError> {
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok(rx)
    }

    async fn collect_from(&self, _from: BlockPosition) -> Result<Backlog, WatchError> {
        Ok(Backlog {
            events: vec![
                raw("DealRegistered", "0xa1", 101, "1"),
                raw("DealActivated", "0xa2", 102, "1"),
                raw("DealRegistered", "0xb1", 103, "2"),
                // Redelivered copy; the record store makes it a no-op.
                raw("DealActivated", "0xa2", 102, "1"),
                raw("DealClosed", "0xa3", 104, "1"),
            ],
            is_complete: true,
            last_position: 104,
        })
    }

    async fn block_header(&self, position: BlockPosition) -> Result<BlockHeader, WatchError> {
        Ok(BlockHeader {
            position,
            timestamp: 1_700_000_000 + position as i64,
        })
    }
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let storage = Arc::new(InMemoryStorage::new());
    let source = Arc::new(ScriptedSource);

    let mut registry = HandlerRegistry::new();
    registry.on_event(Arc::new(DealRegisteredHandler {
        records: storage.clone(),
        deals: storage.clone(),
        source: source.clone(),
    }));
    registry.on_event(Arc::new(DealActivatedHandler {
        records: storage.clone(),
        deals: storage.clone(),
        source: source.clone(),
    }));
    registry.on_event(Arc::new(DealClosedHandler {
        records: storage.clone(),
        deals: storage.clone(),
        source: source.clone(),
    }));

    let config = WatcherBuilder::new()
        .id("demo-watcher")
        .network("demo-net")
        .floor(100)
        .build_config();
    let mut watcher = Watcher::new(config, source, storage.clone(), registry);
    watcher.run().await?;

    let records = EventRecordStore::count(&*storage).await?;
    println!("events recorded: {records}");
    for nonce in ["1", "2"] {
        if let Some(deal) = storage.find_by_nonce(nonce).await? {
            println!("deal {nonce}: {}", deal.status);
        }
    }

    let broker = Arc::new(MemoryBroker::new());
    let notifier = Notifier::new(broker);
    notifier.start().await?;
    notifier
        .send(&Notification {
            data: serde_json::json!({ "records": records }),
            action: "email".into(),
            recipients: vec!["ops@example.com".into()],
        })
        .await?;
    info!("summary notification queued");

    Ok(())
}
