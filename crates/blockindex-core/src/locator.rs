//! Block locators — compact checkpoints that survive reorgs.
//!
//! A locator is a sparse list of block hashes walking from a block back to
//! genesis, most recent first: the ten newest one by one, then exponentially
//! spaced. Given a locator, a chain can find the newest block both sides
//! still share, whatever reorgs happened in between.
//!
//! # Wire format
//!
//! ```text
//! i32 LE   format version (ignored on decode)
//! varint   hash count (CompactSize)
//! [u8;32]  hash × count
//! ```

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::BlockHash;

/// Version written in front of every encoded locator.
pub const LOCATOR_VERSION: i32 = 1;

/// Upper bound on hashes accepted when decoding.
pub const MAX_LOCATOR_HASHES: usize = 101;

/// A checkpoint from which the chain can recover a common ancestor.
///
/// An empty locator means "no progress recorded yet".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocator {
    pub hashes: Vec<BlockHash>,
}

impl BlockLocator {
    pub fn new(hashes: Vec<BlockHash>) -> Self {
        Self { hashes }
    }

    /// The null locator.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.hashes.is_empty()
    }

    /// The block this locator was built from.
    pub fn tip(&self) -> Option<&BlockHash> {
        self.hashes.first()
    }

    /// Serialize to the persisted wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 9 + self.hashes.len() * 32);
        out.extend_from_slice(&LOCATOR_VERSION.to_le_bytes());
        write_compact_size(&mut out, self.hashes.len() as u64);
        for hash in &self.hashes {
            out.extend_from_slice(hash.as_bytes());
        }
        out
    }

    /// Parse the persisted wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, IndexerError> {
        let mut reader = Reader { bytes, pos: 0 };
        reader.take(4)?; // version
        let count = reader.compact_size()?;
        if count > MAX_LOCATOR_HASHES as u64 {
            return Err(IndexerError::Codec(format!(
                "locator has {count} hashes (max {MAX_LOCATOR_HASHES})"
            )));
        }
        let mut hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(reader.take(32)?);
            hashes.push(BlockHash(hash));
        }
        if reader.pos != bytes.len() {
            return Err(IndexerError::Codec(format!(
                "{} trailing bytes after locator",
                bytes.len() - reader.pos
            )));
        }
        Ok(Self { hashes })
    }
}

/// Heights a locator for a block at `height` refers to, newest first.
///
/// Ten consecutive heights, then the step doubles each entry; genesis is
/// always the last entry.
pub fn locator_heights(height: u64) -> Vec<u64> {
    let mut heights = Vec::with_capacity(32);
    let mut step = 1u64;
    let mut current = height;
    loop {
        heights.push(current);
        if current == 0 {
            break;
        }
        current = current.saturating_sub(step);
        if heights.len() > 10 {
            step *= 2;
        }
    }
    heights
}

fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], IndexerError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                IndexerError::Codec(format!(
                    "unexpected end of locator at byte {} (wanted {n})",
                    self.pos
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn compact_size(&mut self) -> Result<u64, IndexerError> {
        let tag = self.take(1)?[0];
        let (value, min) = match tag {
            0xfd => {
                let b = self.take(2)?;
                (u16::from_le_bytes([b[0], b[1]]) as u64, 0xfd)
            }
            0xfe => {
                let b = self.take(4)?;
                (u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64, 0x1_0000)
            }
            0xff => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(self.take(8)?);
                (u64::from_le_bytes(buf), 0x1_0000_0000)
            }
            n => return Ok(n as u64),
        };
        if value < min {
            return Err(IndexerError::Codec("non-canonical compact size".into()));
        }
        Ok(value)
    }
}
