//! Wire envelopes exchanged over the broker (JSON over byte payloads).

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

// ─── SyncEnvelope ────────────────────────────────────────────────────────────

/// Direction of a sync-protocol envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Request,
    Response,
}

/// Typed payload carried by a sync envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    /// Payload discriminator (e.g. `"missing_blocks"`).
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

/// Wire message for the block-range / transaction-set coordination protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Queue name of the worker that opened the exchange.
    pub initiator: String,
    /// Queue name the envelope is addressed to.
    pub recipient: String,
    pub payload: SyncPayload,
}

impl SyncEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(self).map_err(|e| BrokerError::Parse(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BrokerError> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::Parse(e.to_string()))
    }
}

// ─── WorkerMessage ───────────────────────────────────────────────────────────

/// Wire message for the all-to-all fanout bus. Recipients self-filter by
/// `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

impl WorkerMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(self).map_err(|e| BrokerError::Parse(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BrokerError> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::Parse(e.to_string()))
    }
}

// ─── Transactions ────────────────────────────────────────────────────────────

/// A raw transaction broadcast over the transactions exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub sender: String,
    pub amount: u64,
}

/// A batch of transactions as published by a watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionBatch {
    pub transactions: Vec<Transaction>,
}

impl TransactionBatch {
    pub fn to_bytes(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(self).map_err(|e| BrokerError::Parse(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BrokerError> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_envelope_wire_format() {
        let env = SyncEnvelope {
            kind: EnvelopeKind::Request,
            initiator: "worker-a".into(),
            recipient: "fetcher".into(),
            payload: SyncPayload {
                kind: "missing_blocks".into(),
                data: serde_json::json!({ "from": 10, "to": 20 }),
            },
        };

        let json: serde_json::Value =
            serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["payload"]["type"], "missing_blocks");
        assert_eq!(json["payload"]["data"]["from"], 10);

        let back = SyncEnvelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn malformed_payload_is_parse_error() {
        let err = SyncEnvelope::from_bytes(b"not json").unwrap_err();
        assert!(err.is_parse());

        let err = WorkerMessage::from_bytes(b"{\"nope\":1}").unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn worker_message_type_field() {
        let msg = WorkerMessage {
            kind: "cursor_report".into(),
            payload: serde_json::json!({ "position": 42 }),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "cursor_report");
    }
}
