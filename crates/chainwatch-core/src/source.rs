//! `ChainEventSource` trait — abstraction over the contract log provider.
//!
//! Push (live subscription) and pull (backfill range) access to contract
//! logs. Both paths deliver at-least-once: the live subscription may
//! redeliver after reconnects, and a pulled range may overlap events already
//! seen live.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::WatchError;
use crate::types::{BlockPosition, RawEvent};

/// Stream of live push events.
pub type EventStream = mpsc::UnboundedReceiver<RawEvent>;

/// Result of a backfill pull over `[from, head]`.
#[derive(Debug, Clone)]
pub struct Backlog {
    /// Collected events, roughly in position order.
    pub events: Vec<RawEvent>,
    /// `false` signals a truncated range; the caller retries from
    /// `last_position`.
    pub is_complete: bool,
    /// Highest position covered by this pull.
    pub last_position: BlockPosition,
}

/// Minimal block header — enough to stamp records with a timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub position: BlockPosition,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

/// Abstracts over chain RPC backends that serve contract logs.
#[async_trait]
pub trait ChainEventSource: Send + Sync {
    /// Start the live push subscription.
    async fn subscribe(&self) -> Result<EventStream, WatchError>;

    /// Pull all events in `[from, head]`.
    async fn collect_from(&self, from: BlockPosition) -> Result<Backlog, WatchError>;

    /// Fetch the header of a block (suspends on network I/O).
    async fn block_header(&self, position: BlockPosition) -> Result<BlockHeader, WatchError>;
}
