//! SQLite storage backend for blockindex.
//!
//! Every index gets one key-value table in a single SQLite file. A
//! [`WriteBatch`] is applied inside one transaction, so an index's derived
//! records and its checkpoint always land together.
//!
//! # Usage
//! ```rust,no_run
//! use blockindex_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./txindex.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use blockindex_core::error::IndexerError;
use blockindex_core::store::{BatchOp, PersistentStore, WriteBatch};

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed key-value store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the store is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        // Each connection to `:memory:` is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create the table and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv (
                key   BLOB PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Number of stored entries.
    pub async fn len(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM kv")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    pub async fn is_empty(&self) -> Result<bool, IndexerError> {
        Ok(self.len().await? == 0)
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|row| row.get::<Vec<u8>, _>("value")))
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<(), IndexerError> {
        let ops = batch.len();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    sqlx::query("INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)")
                        .bind(key)
                        .bind(value)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                }
                BatchOp::Delete { key } => {
                    sqlx::query("DELETE FROM kv WHERE key = ?")
                        .bind(key)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                }
            }
        }
        tx.commit().await.map_err(storage_err)?;
        debug!(ops, "batch committed");
        Ok(())
    }
}
