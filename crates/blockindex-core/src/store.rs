//! Persistent key-value store contract and an in-memory implementation.
//!
//! The engine only needs point reads and atomic batch writes. Every write an
//! index makes goes through a [`WriteBatch`] that lands in full or not at all.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::IndexerError;

/// A single operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered set of writes applied atomically by [`PersistentStore::write_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Key-ordered store with point reads and atomic batched writes.
///
/// Implementations include [`MemoryStore`] and `SqliteStore`
/// (in `blockindex-storage`).
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Read the value stored under `key`.
    async fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError>;

    /// Apply every operation in `batch`, or none of them.
    async fn write_batch(&self, batch: WriteBatch) -> Result<(), IndexerError>;
}

// ─── In-memory store ──────────────────────────────────────────────────────────

/// In-memory store for tests and ephemeral indexes.
///
/// Writes can be made to fail on demand to exercise recovery paths.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `write_batch` fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Synchronous read, for inspection.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.lock().get(key).cloned()
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .lock()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError> {
        Ok(self.get(key))
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<(), IndexerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(IndexerError::Storage("write rejected (fail_writes set)".into()));
        }
        let mut data = self.data.lock();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
