//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::types::BlockPosition;

/// Errors that can occur while watching a contract domain.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("chain source error: {0}")]
    Source(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("handler error for '{kind}' at position {position}: {reason}")]
    Handler {
        kind: String,
        position: BlockPosition,
        reason: String,
    },

    /// The source returned a truncated range. The cursor has already been
    /// advanced to `last_position`; a retry resumes past applied work.
    #[error("incomplete backfill, cursor advanced to {last_position}")]
    IncompleteBackfill { last_position: BlockPosition },

    /// The live push subscription is registered once per process lifetime.
    #[error("live subscription already registered")]
    AlreadySubscribed,
}

impl WatchError {
    /// Returns `true` if the error is a truncated backfill (retryable).
    pub fn is_incomplete_backfill(&self) -> bool {
        matches!(self, Self::IncompleteBackfill { .. })
    }
}
