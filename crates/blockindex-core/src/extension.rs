//! The per-index extension contract.
//!
//! The engine knows nothing about what an index stores. Each concrete index
//! (transaction locations, block filters, statistics, ...) implements
//! [`IndexExtension`] and the engine calls its hooks in chain order.

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::store::WriteBatch;
use crate::types::{BlockInfo, BlockKey};

/// Options an extension hands to the chain when it subscribes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOptions {
    /// Name used for the catch-up task's tracing span.
    pub thread_name: String,
}

/// Hooks implemented by each concrete index.
///
/// Hooks are expected to log their own detailed diagnostics before
/// returning `Err`; the engine treats a failed `init` or `append` as fatal,
/// a failed `remove` as a poisoned rewind, and a failed `commit` as a failed
/// flush.
#[async_trait]
pub trait IndexExtension: Send + Sync {
    /// Human-readable index name, used in logs and summaries.
    fn name(&self) -> &str;

    /// Whether the index can run on a chain that prunes old block data.
    fn allow_prune(&self) -> bool {
        false
    }

    fn thread_name(&self) -> String {
        format!("index.{}", self.name())
    }

    fn options(&self) -> ExtensionOptions {
        ExtensionOptions {
            thread_name: self.thread_name(),
        }
    }

    /// Called once the resume point is known (`None` = build from genesis).
    async fn init(&self, _resume_point: Option<&BlockKey>) -> Result<(), IndexerError> {
        Ok(())
    }

    /// Add the records derived from a connected block.
    async fn append(&self, block: &BlockInfo) -> Result<(), IndexerError>;

    /// Undo the records derived from a disconnected block.
    ///
    /// Indexes whose records stay valid across reorgs can keep the default.
    async fn remove(&self, _block: &BlockInfo) -> Result<(), IndexerError> {
        Ok(())
    }

    /// Stage pending writes into `batch`; they land atomically with the
    /// checkpoint.
    async fn commit(&self, _batch: &mut WriteBatch) -> Result<(), IndexerError> {
        Ok(())
    }
}
