//! Event record store — append-only, uniquely-keyed table of observed
//! events.
//!
//! A record is keyed by `(tx_hash, network)` and written at most once. The
//! create operation reports whether the row was newly inserted; that flag,
//! not the row's existence, gates downstream side effects. This is the sole
//! mechanism defeating at-least-once delivery from both the chain source and
//! concurrent live/backfill races.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WatchError;
use crate::types::{BlockPosition, Network};

/// A durable record of one observed contract event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Transaction hash (`0x…`) — unique together with `network`.
    pub tx_hash: String,
    /// Network the event was observed on.
    pub network: Network,
    /// Event kind label (e.g. `"deal_activated"`).
    pub kind: String,
    /// Positional fields as JSON.
    pub fields: serde_json::Value,
    /// Block the event was emitted in.
    pub block_position: BlockPosition,
    /// Block timestamp (seconds since epoch).
    pub timestamp: i64,
}

impl EventRecord {
    /// The block timestamp as a UTC datetime. A timestamp outside chrono's
    /// representable range falls back to the epoch.
    pub fn recorded_at(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp(self.timestamp, 0).unwrap_or_default()
    }
}

/// Trait for the idempotent event-record table.
#[async_trait]
pub trait EventRecordStore: Send + Sync {
    /// Insert the record if its `(tx_hash, network)` key is absent.
    ///
    /// Returns the stored row and `true` when it was newly inserted. On
    /// replay the existing row is returned with `false` and callers must
    /// skip side effects.
    async fn create_if_absent(
        &self,
        record: EventRecord,
    ) -> Result<(EventRecord, bool), WatchError>;

    /// Look up a record by key.
    async fn find(
        &self,
        tx_hash: &str,
        network: &Network,
    ) -> Result<Option<EventRecord>, WatchError>;

    /// Total number of stored records.
    async fn count(&self) -> Result<u64, WatchError>;
}

// ─── In-memory store (for tests) ─────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory event-record store for tests and ephemeral watchers.
#[derive(Default)]
pub struct MemoryRecordStore {
    rows: Mutex<HashMap<(String, String), EventRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventRecordStore for MemoryRecordStore {
    async fn create_if_absent(
        &self,
        record: EventRecord,
    ) -> Result<(EventRecord, bool), WatchError> {
        let key = (record.tx_hash.clone(), record.network.as_str().to_string());
        let mut rows = self.rows.lock().unwrap();
        match rows.get(&key) {
            Some(existing) => Ok((existing.clone(), false)),
            None => {
                rows.insert(key, record.clone());
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
        Ok(self.rows.lock().unwrap().get(&key).cloned())
    }

    async fn count(&self) -> Result<u64, WatchError> {
        Ok(self.rows.lock().unwrap().len() as u64)
    }
}
