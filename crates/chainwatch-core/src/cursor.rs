//! Cursor store — persists the last-processed chain position per network.
//!
//! The cursor is the watcher's resume point: on restart, backfill starts
//! from the stored position rather than the configured floor. The store does
//! not enforce monotonicity itself; callers only ever advance forward. The
//! one sanctioned jump is at deploy time: a configured floor above the
//! stored value lifts the cursor, so an operator can fast-forward a watcher
//! past block ranges it should never ingest.

use async_trait::async_trait;

use crate::error::WatchError;
use crate::types::{BlockPosition, Network};

/// Trait for storing and loading cursors.
///
/// Implementations include `MemoryCursorStore`, `SqliteStorage`, and
/// `PostgresStorage`.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Load the cursor position for a network (`None` if absent).
    async fn get(&self, network: &Network) -> Result<Option<BlockPosition>, WatchError>;

    /// Create the cursor at `floor` if absent. An existing cursor below
    /// `floor` is lifted to it (operator fast-forward); one at or above
    /// `floor` is left untouched. Returns the effective position.
    async fn create_if_absent(
        &self,
        network: &Network,
        floor: BlockPosition,
    ) -> Result<BlockPosition, WatchError>;

    /// Overwrite the cursor position. Callers must only ever advance
    /// forward.
    async fn set(&self, network: &Network, position: BlockPosition) -> Result<(), WatchError>;
}

// ─── In-memory store (for tests) ─────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory cursor store for tests and ephemeral watchers.
#[derive(Default)]
pub struct MemoryCursorStore {
    data: Mutex<HashMap<String, BlockPosition>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, network: &Network) -> Result<Option<BlockPosition>, WatchError> {
        Ok(self.data.lock().unwrap().get(network.as_str()).copied())
    }

    async fn create_if_absent(
        &self,
        network: &Network,
        floor: BlockPosition,
    ) -> Result<BlockPosition, WatchError> {
        let mut data = self.data.lock().unwrap();
        let position = data.entry(network.as_str().to_string()).or_insert(floor);
        if *position < floor {
            *position = floor;
        }
        Ok(*position)
    }

    async fn set(&self, network: &Network, position: BlockPosition) -> Result<(), WatchError> {
        self.data
            .lock()
            .unwrap()
            .insert(network.as_str().to_string(), position);
        Ok(())
    }
}
