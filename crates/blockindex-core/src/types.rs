//! Shared types for the synchronization engine.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ─── BlockHash ────────────────────────────────────────────────────────────────

/// A 32-byte block hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// The all-zero hash, used as "no block".
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({self})")
    }
}

impl From<[u8; 32]> for BlockHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

// ─── BlockKey ─────────────────────────────────────────────────────────────────

/// A lightweight, comparable handle on a block: hash plus height.
///
/// The chain owns the block data; the engine only ever holds keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub hash: BlockHash,
    pub height: u64,
}

impl BlockKey {
    pub fn new(hash: BlockHash, height: u64) -> Self {
        Self { hash, height }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.height)
    }
}

// ─── BlockInfo ────────────────────────────────────────────────────────────────

/// A block as delivered by the chain to an index.
///
/// `data` is `None` for header-only lookups and for the markers the chain
/// sends at the start and end of a catch-up run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: BlockHash,
    /// Parent hash; `None` for genesis.
    pub prev_hash: Option<BlockHash>,
    pub height: u64,
    /// Serialized block payload.
    pub data: Option<Arc<[u8]>>,
}

impl BlockInfo {
    pub fn key(&self) -> BlockKey {
        BlockKey::new(self.hash, self.height)
    }

    /// Key of the parent block, if any.
    pub fn parent_key(&self) -> Option<BlockKey> {
        match (self.prev_hash, self.height.checked_sub(1)) {
            (Some(hash), Some(height)) => Some(BlockKey::new(hash, height)),
            _ => None,
        }
    }

    /// Returns `true` if `self` is the direct child of `parent`.
    pub fn extends(&self, parent: &BlockKey) -> bool {
        self.height == parent.height + 1 && self.prev_hash == Some(parent.hash)
    }

    /// Returns a copy without the payload.
    pub fn header(&self) -> Self {
        Self {
            data: None,
            ..self.clone()
        }
    }
}

// ─── IndexSummary ─────────────────────────────────────────────────────────────

/// Point-in-time view of an index's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub name: String,
    pub synced: bool,
    /// Height of the best block; `0` when nothing has been indexed yet.
    pub best_block_height: u64,
    /// Hash of the best block. Before the first block is indexed (before
    /// `init`, or on an empty chain) there is no genesis hash to report, so
    /// this is [`BlockHash::ZERO`].
    pub best_block_hash: BlockHash,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
