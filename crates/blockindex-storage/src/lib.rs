//! blockindex-storage — durable [`PersistentStore`] backends for blockindex.
//!
//! Backends:
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)
//!
//! The in-memory store lives in `blockindex-core` as
//! [`MemoryStore`](blockindex_core::MemoryStore).
//!
//! [`PersistentStore`]: blockindex_core::PersistentStore

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
