//! Checkpoint persistence — the locator record and the atomic commit.
//!
//! The checkpoint is one fixed key holding the last committed
//! [`BlockLocator`]. The extension's own writes and the checkpoint go into
//! the same [`WriteBatch`], so the locator can never get ahead of (or fall
//! behind) the derived records it vouches for.

use tracing::debug;

use crate::error::IndexerError;
use crate::extension::IndexExtension;
use crate::locator::BlockLocator;
use crate::store::{PersistentStore, WriteBatch};

/// Key of the best-block checkpoint record.
pub const DB_BEST_BLOCK: &[u8] = b"B";

/// Read the persisted checkpoint.
///
/// A missing, unreadable or undecodable record is reported as `None`: it
/// just means the index starts from genesis.
pub async fn read_checkpoint(store: &dyn PersistentStore) -> Option<BlockLocator> {
    let bytes = match store.read(DB_BEST_BLOCK).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(e) => {
            debug!(error = %e, "checkpoint unreadable, treating as absent");
            return None;
        }
    };
    match BlockLocator::decode(&bytes) {
        Ok(locator) if !locator.is_null() => Some(locator),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "checkpoint undecodable, treating as absent");
            None
        }
    }
}

/// Stage the checkpoint record into `batch`.
pub fn write_checkpoint(batch: &mut WriteBatch, locator: &BlockLocator) {
    batch.put(DB_BEST_BLOCK.to_vec(), locator.encode());
}

/// Atomically persist the extension's pending writes together with `locator`.
///
/// A null locator is a successful no-op: nothing has been indexed, so there
/// is nothing durable to claim and the extension's `commit` is not called.
pub async fn commit(
    store: &dyn PersistentStore,
    extension: &dyn IndexExtension,
    locator: &BlockLocator,
) -> Result<(), IndexerError> {
    if locator.is_null() {
        return Ok(());
    }
    let mut batch = WriteBatch::new();
    extension.commit(&mut batch).await?;
    write_checkpoint(&mut batch, locator);
    let ops = batch.len();
    store.write_batch(batch).await?;
    debug!(
        index = extension.name(),
        ops,
        tip = ?locator.tip(),
        "checkpoint committed"
    );
    Ok(())
}
