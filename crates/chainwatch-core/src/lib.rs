//! chainwatch-core — resumable, idempotent contract-event ingestion.
//!
//! # Architecture
//!
//! ```text
//! WatcherBuilder → Watcher
//!                     ├── ChainEventSource  (push subscription + backfill pull)
//!                     ├── CursorStore       (last processed position per network)
//!                     ├── HandlerRegistry   (one handler set per event variant)
//!                     └── EventRecordStore  (create-if-absent dedup keyed by
//!                                            transaction hash + network)
//! ```
//!
//! The watcher drains the backlog between the stored cursor and the chain
//! head, dispatching events sequentially, then follows the live push
//! subscription through the same handlers. Live and backfill delivery may
//! overlap; correctness rests on the unique `(tx_hash, network)` key and on
//! side effects gated by the newly-created flag, not on any lock.

pub mod builder;
pub mod cursor;
pub mod deals;
pub mod error;
pub mod handler;
pub mod record;
pub mod source;
pub mod types;
pub mod watcher;

pub use builder::WatcherBuilder;
pub use cursor::{CursorStore, MemoryCursorStore};
pub use deals::{Deal, DealStatus, DealStore, MemoryDealStore};
pub use error::WatchError;
pub use handler::{EventHandler, HandlerRegistry};
pub use record::{EventRecord, EventRecordStore, MemoryRecordStore};
pub use source::{Backlog, BlockHeader, ChainEventSource, EventStream};
pub use types::{BlockPosition, ChainEvent, EventKind, EventPayload, Network, RawEvent, WatchContext, WatchPhase};
pub use watcher::{Watcher, WatcherConfig, WatcherEvent};
