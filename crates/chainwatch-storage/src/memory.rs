//! In-memory storage backend.
//!
//! One handle carrying all three stores, so a test watcher can run against
//! a single `Arc<InMemoryStorage>`. Nothing survives a drop.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use chainwatch_core::cursor::CursorStore;
use chainwatch_core::deals::{Deal, DealStatus, DealStore};
use chainwatch_core::error::WatchError;
use chainwatch_core::record::{EventRecord, EventRecordStore};
use chainwatch_core::types::{BlockPosition, Network};

/// In-memory cursors, event records, and deals behind one handle.
#[derive(Default)]
pub struct InMemoryStorage {
    cursors: Mutex<HashMap<String, BlockPosition>>,
    records: Mutex<HashMap<(String, String), EventRecord>>,
    deals: Mutex<HashMap<String, Deal>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for InMemoryStorage {
    async fn get(&self, network: &Network) -> Result<Option<BlockPosition>, WatchError> {
        Ok(self.cursors.lock().unwrap().get(network.as_str()).copied())
    }

    async fn create_if_absent(
        &self,
        network: &Network,
        floor: BlockPosition,
    ) -> Result<BlockPosition, WatchError> {
        let mut cursors = self.cursors.lock().unwrap();
        let position = cursors.entry(network.as_str().to_string()).or_insert(floor);
        if *position < floor {
            *position = floor;
        }
        Ok(*position)
    }

    async fn set(&self, network: &Network, position: BlockPosition) -> Result<(), WatchError> {
        self.cursors
            .lock()
            .unwrap()
            .insert(network.as_str().to_string(), position);
        Ok(())
    }
}

#[async_trait]
impl EventRecordStore for InMemoryStorage {
    async fn create_if_absent(
        &self,
        record: EventRecord,
    ) -> Result<(EventRecord, bool), WatchError> {
        let key = (record.tx_hash.clone(), record.network.as_str().to_string());
        let mut records = self.records.lock().unwrap();
        match records.get(&key) {
            Some(existing) => Ok((existing.clone(), false)),
            None => {
                records.insert(key, record.clone());
                Ok((record, true))
            }
        }
    }

    async fn find(
        &self,
        tx_hash: &str,
        network: &Network,
    ) -> Result<Option<EventRecord>, WatchError> {
        let key = (tx_hash.to_string(), network.as_str().to_string());
        Ok(self.records.lock().unwrap().get(&key).cloned())
    }

    async fn count(&self) -> Result<u64, WatchError> {
        Ok(self.records.lock().unwrap().len() as u64)
    }
}

#[async_trait]
impl DealStore for InMemoryStorage {
    async fn find_by_nonce(&self, nonce: &str) -> Result<Option<Deal>, WatchError> {
        Ok(self.deals.lock().unwrap().get(nonce).cloned())
    }

    async fn create_pending(&self, nonce: &str) -> Result<bool, WatchError> {
        let mut deals = self.deals.lock().unwrap();
        if deals.contains_key(nonce) {
            return Ok(false);
        }
        deals.insert(
            nonce.to_string(),
            Deal {
                nonce: nonce.to_string(),
                status: DealStatus::Pending,
            },
        );
        Ok(true)
    }

    async fn set_status(&self, nonce: &str, status: DealStatus) -> Result<(), WatchError> {
        let mut deals = self.deals.lock().unwrap();
        match deals.get_mut(nonce) {
            Some(deal) => {
                deal.status = status;
                Ok(())
            }
            None => Err(WatchError::Storage(format!("no deal with nonce {nonce}"))),
        }
    }
}
