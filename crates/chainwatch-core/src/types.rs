//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

/// A chain position (block height).
pub type BlockPosition = u64;

// ─── Network ─────────────────────────────────────────────────────────────────

/// Network identifier (e.g. `"mainnet"`, `"testnet"`).
///
/// Event-record keys are network-scoped because identical transaction hashes
/// can recur across chains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Network(String);

impl Network {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Network {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── RawEvent ────────────────────────────────────────────────────────────────

/// A contract log as delivered by the chain event source, before decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event name as emitted by the contract (e.g. `"DealActivated"`).
    pub kind: String,
    /// Transaction hash (`0x…`).
    pub tx_hash: String,
    /// Block the log was emitted in.
    pub block_position: BlockPosition,
    /// Decoded positional fields as JSON.
    pub fields: serde_json::Value,
}

// ─── ChainEvent ──────────────────────────────────────────────────────────────

/// A decoded contract event with a closed payload union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    /// Transaction hash (`0x…`).
    pub tx_hash: String,
    /// Block the event was emitted in.
    pub block_position: BlockPosition,
    /// The decoded, variant-typed payload.
    pub payload: EventPayload,
}

/// The closed set of contract events this watcher domain understands.
///
/// Dispatch is an exhaustive match over these variants; there is no
/// string-kind comparison past the decode step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// A deal was registered on-chain.
    DealRegistered { nonce: String },
    /// A registered deal became active.
    DealActivated { nonce: String },
    /// An active deal was closed.
    DealClosed { nonce: String },
}

impl EventPayload {
    /// The fieldless discriminant, used as registry key and record kind.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DealRegistered { .. } => EventKind::DealRegistered,
            Self::DealActivated { .. } => EventKind::DealActivated,
            Self::DealClosed { .. } => EventKind::DealClosed,
        }
    }

    /// The deal nonce this event references.
    pub fn nonce(&self) -> &str {
        match self {
            Self::DealRegistered { nonce }
            | Self::DealActivated { nonce }
            | Self::DealClosed { nonce } => nonce,
        }
    }
}

/// Fieldless event discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    DealRegistered,
    DealActivated,
    DealClosed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DealRegistered => write!(f, "deal_registered"),
            Self::DealActivated => write!(f, "deal_activated"),
            Self::DealClosed => write!(f, "deal_closed"),
        }
    }
}

impl ChainEvent {
    /// Decode a raw log into a typed event.
    ///
    /// Returns `None` for an unrecognized kind or missing fields — the
    /// watcher drops such logs silently rather than erroring.
    pub fn decode(raw: &RawEvent) -> Option<ChainEvent> {
        let nonce = raw.fields.get("nonce")?.as_str()?.to_string();
        let payload = match raw.kind.as_str() {
            "DealRegistered" => EventPayload::DealRegistered { nonce },
            "DealActivated" => EventPayload::DealActivated { nonce },
            "DealClosed" => EventPayload::DealClosed { nonce },
            _ => return None,
        };
        Some(ChainEvent {
            tx_hash: raw.tx_hash.clone(),
            block_position: raw.block_position,
            payload,
        })
    }
}

// ─── WatchContext ────────────────────────────────────────────────────────────

/// Context passed to event handlers during dispatch.
#[derive(Debug, Clone)]
pub struct WatchContext {
    /// The network this watcher ingests from.
    pub network: Network,
    /// Current ingestion phase.
    pub phase: WatchPhase,
}

/// The current phase of the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchPhase {
    /// Draining the backlog between the stored cursor and the chain head.
    Backfill,
    /// Following the live push subscription.
    Live,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
