//! SQLite storage backend for ChainWatch.
//!
//! Persists cursors, event records, and deals to a single SQLite file.
//! Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! Idempotent creates ride on `INSERT OR IGNORE` plus `rows_affected`:
//! the database, not application state, decides whether a row is new, so
//! the newly-created flag stays correct across processes.
//!
//! # Usage
//! ```rust,no_run
//! use chainwatch_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./watch.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainwatch_core::cursor::CursorStore;
use chainwatch_core::deals::{Deal, DealStatus, DealStore};
use chainwatch_core::error::WatchError;
use chainwatch_core::record::{EventRecord, EventRecordStore};
use chainwatch_core::types::{BlockPosition, Network};

fn parse_status(s: &str) -> Result<DealStatus, WatchError> {
    match s {
        "pending" => Ok(DealStatus::Pending),
        "active" => Ok(DealStatus::Active),
        "closed" => Ok(DealStatus::Closed),
        other => Err(WatchError::Storage(format!("unknown deal status {other:?}"))),
    }
}

/// SQLite-backed storage for cursors, event records, and deals.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./watch.db"`) or a full
    /// SQLite URL (`"sqlite:./watch.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, WatchError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| WatchError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, WatchError> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(|e| WatchError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), WatchError> {
        // WAL mode — better concurrent read throughput
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| WatchError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cursors (
                network  TEXT    NOT NULL PRIMARY KEY,
                position INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| WatchError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS event_records (
                tx_hash        TEXT    NOT NULL,
                network        TEXT    NOT NULL,
                kind           TEXT    NOT NULL,
                fields_json    TEXT    NOT NULL,
                block_position INTEGER NOT NULL,
                timestamp      INTEGER NOT NULL,
                PRIMARY KEY (tx_hash, network)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| WatchError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS deals (
                nonce  TEXT NOT NULL PRIMARY KEY,
                status TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| WatchError::Storage(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_kind ON event_records (kind);")
            .execute(&self.pool)
            .await
            .map_err(|e| WatchError::Storage(e.to_string()))?;

        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> EventRecord {
        let fields_str: String = row.get("fields_json");
        let fields: serde_json::Value =
            serde_json::from_str(&fields_str).unwrap_or(serde_json::Value::Null);

        EventRecord {
            tx_hash: row.get("tx_hash"),
            network: Network::from(row.get::<String, _>("network").as_str()),
            kind: row.get("kind"),
            fields,
            block_position: row.get::<i64, _>("block_position") as u64,
            timestamp: row.get("timestamp"),
        }
    }
}

// ─── CursorStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl CursorStore for SqliteStorage {
    async fn get(&self, network: &Network) -> Result<Option<BlockPosition>, WatchError> {
        let row = sqlx::query("SELECT position FROM cursors WHERE network = ?")
            .bind(network.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WatchError::Storage(e.to_string()))?;

        Ok(row.map(|r| r.get::<i64, _>("position") as u64))
    }

    async fn create_if_absent(
        &self,
        network: &Network,
        floor: BlockPosition,
    ) -> Result<BlockPosition, WatchError> {
        // Upsert lifts a stored position below the floor (operator
        // fast-forward) and leaves one at or above it alone.
        sqlx::query(
            "INSERT INTO cursors (network, position) VALUES (?, ?)
             ON CONFLICT (network) DO UPDATE SET position = MAX(position, excluded.position)",
        )
        .bind(network.as_str())
        .bind(floor as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| WatchError::Storage(e.to_string()))?;

        let row = sqlx::query("SELECT position FROM cursors WHERE network = ?")
            .bind(network.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| WatchError::Storage(e.to_string()))?;

        Ok(row.get::<i64, _>("position") as u64)
    }

    async fn set(&self, network: &Network, position: BlockPosition) -> Result<(), WatchError> {
        sqlx::query("INSERT OR REPLACE INTO cursors (network, position) VALUES (?, ?)")
            .bind(network.as_str())
            .bind(position as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| WatchError::Storage(e.to_string()))?;

        debug!(network = %network, position, "cursor saved");
        Ok(())
    }
}

// ─── EventRecordStore impl ───────────────────────────────────────────────────

#[async_trait]
impl EventRecordStore for SqliteStorage {
    async fn create_if_absent(
        &self,
        record: EventRecord,
    ) -> Result<(EventRecord, bool), WatchError> {
        let fields = serde_json::to_string(&record.fields)
            .map_err(|e| WatchError::Storage(e.to_string()))?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO event_records
             (tx_hash, network, kind, fields_json, block_position, timestamp)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.tx_hash)
        .bind(record.network.as_str())
        .bind(&record.kind)
        .bind(&fields)
        .bind(record.block_position as i64)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| WatchError::Storage(e.to_string()))?;

        if result.rows_affected() == 1 {
            debug!(tx_hash = %record.tx_hash, kind = %record.kind, "event record stored");
            return Ok((record, true));
        }

        // Replay: return the row that won the race.
        let existing = self
            .find(&record.tx_hash, &record.network)
            .await?
            .ok_or_else(|| WatchError::Storage("record vanished after conflict".into()))?;
        Ok((existing, false))
    }

    async fn find(
        &self,
        tx_hash: &str,
        network: &Network,
    ) -> Result<Option<EventRecord>, WatchError> {
        let row = sqlx::query(
            "SELECT tx_hash, network, kind, fields_json, block_position, timestamp
             FROM event_records WHERE tx_hash = ? AND network = ?",
        )
        .bind(tx_hash)
        .bind(network.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| WatchError::Storage(e.to_string()))?;

        Ok(row.map(|r| Self::row_to_record(&r)))
    }

    async fn count(&self) -> Result<u64, WatchError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM event_records")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| WatchError::Storage(e.to_string()))?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

// ─── DealStore impl ──────────────────────────────────────────────────────────

#[async_trait]
impl DealStore for SqliteStorage {
    async fn find_by_nonce(&self, nonce: &str) -> Result<Option<Deal>, WatchError> {
        let row = sqlx::query("SELECT nonce, status FROM deals WHERE nonce = ?")
            .bind(nonce)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WatchError::Storage(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Deal {
                nonce: r.get("nonce"),
                status: parse_status(&r.get::<String, _>("status"))?,
            })),
            None => Ok(None),
        }
    }

    async fn create_pending(&self, nonce: &str) -> Result<bool, WatchError> {
        let result = sqlx::query("INSERT OR IGNORE INTO deals (nonce, status) VALUES (?, ?)")
            .bind(nonce)
            .bind(DealStatus::Pending.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| WatchError::Storage(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_status(&self, nonce: &str, status: DealStatus) -> Result<(), WatchError> {
        let result = sqlx::query("UPDATE deals SET status = ? WHERE nonce = ?")
            .bind(status.to_string())
            .bind(nonce)
            .execute(&self.pool)
            .await
            .map_err(|e| WatchError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(WatchError::Storage(format!("no deal with nonce {nonce}")));
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(tx: &str, position: u64) -> EventRecord {
        EventRecord {
            tx_hash: tx.to_string(),
            network: Network::from("testnet"),
            kind: "deal_activated".into(),
            fields: serde_json::json!({ "nonce": "5" }),
            block_position: position,
            timestamp: 1_700_000_000 + position as i64,
        }
    }

    // ── CursorStore ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cursor_created_at_floor_then_kept() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let net = Network::from("testnet");

        assert!(CursorStore::get(&store, &net).await.unwrap().is_none());

        let pos = CursorStore::create_if_absent(&store, &net, 1_000)
            .await
            .unwrap();
        assert_eq!(pos, 1_000);

        // A second boot with a lower floor must not regress the cursor.
        CursorStore::set(&store, &net, 5_000).await.unwrap();
        let pos = CursorStore::create_if_absent(&store, &net, 1_000)
            .await
            .unwrap();
        assert_eq!(pos, 5_000);
    }

    #[tokio::test]
    async fn raised_floor_fast_forwards_cursor() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let net = Network::from("testnet");

        CursorStore::set(&store, &net, 5_000).await.unwrap();

        let pos = CursorStore::create_if_absent(&store, &net, 9_000)
            .await
            .unwrap();
        assert_eq!(pos, 9_000);
        assert_eq!(CursorStore::get(&store, &net).await.unwrap(), Some(9_000));
    }

    #[tokio::test]
    async fn cursors_are_isolated_per_network() {
        let store = SqliteStorage::in_memory().await.unwrap();
        CursorStore::set(&store, &Network::from("mainnet"), 100)
            .await
            .unwrap();
        CursorStore::set(&store, &Network::from("testnet"), 200)
            .await
            .unwrap();

        assert_eq!(
            CursorStore::get(&store, &Network::from("mainnet"))
                .await
                .unwrap(),
            Some(100)
        );
        assert_eq!(
            CursorStore::get(&store, &Network::from("testnet"))
                .await
                .unwrap(),
            Some(200)
        );
    }

    // ── EventRecordStore ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn record_create_is_idempotent() {
        let store = SqliteStorage::in_memory().await.unwrap();

        let (_, created) = EventRecordStore::create_if_absent(&store, sample_record("0xabc", 100))
            .await
            .unwrap();
        assert!(created);

        let mut dup = sample_record("0xabc", 999);
        dup.kind = "deal_closed".into();
        let (row, created) = EventRecordStore::create_if_absent(&store, dup).await.unwrap();

        // Original row wins; the replayed copy is discarded.
        assert!(!created);
        assert_eq!(row.block_position, 100);
        assert_eq!(row.kind, "deal_activated");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn record_fields_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        EventRecordStore::create_if_absent(&store, sample_record("0x1", 42))
            .await
            .unwrap();

        let row = store
            .find("0x1", &Network::from("testnet"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.fields["nonce"], "5");
        assert_eq!(row.timestamp, 1_700_000_042);
    }

    #[tokio::test]
    async fn same_hash_different_network_is_distinct() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut other = sample_record("0xabc", 100);
        other.network = Network::from("mainnet");

        let (_, a) = EventRecordStore::create_if_absent(&store, sample_record("0xabc", 100))
            .await
            .unwrap();
        let (_, b) = EventRecordStore::create_if_absent(&store, other).await.unwrap();
        assert!(a);
        assert!(b);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    // ── DealStore ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn deal_lifecycle() {
        let store = SqliteStorage::in_memory().await.unwrap();

        assert!(store.create_pending("7").await.unwrap());
        assert!(!store.create_pending("7").await.unwrap());

        store.set_status("7", DealStatus::Active).await.unwrap();
        let deal = store.find_by_nonce("7").await.unwrap().unwrap();
        assert_eq!(deal.status, DealStatus::Active);

        store.set_status("7", DealStatus::Closed).await.unwrap();
        let deal = store.find_by_nonce("7").await.unwrap().unwrap();
        assert_eq!(deal.status, DealStatus::Closed);
    }

    #[tokio::test]
    async fn set_status_on_unknown_deal_is_an_error() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert!(store.set_status("404", DealStatus::Closed).await.is_err());
    }
}
