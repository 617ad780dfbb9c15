//! In-memory chain — a block tree with an active branch, for tests and demos.
//!
//! Live subscribers are notified synchronously as blocks are pushed or the
//! active branch changes. A subscriber that attaches behind the tip is
//! caught up by a driver task (started by [`Subscription::start`]) that
//! first disconnects whatever it holds off the active branch, then connects
//! forward to the tip, and finally switches the subscriber to live delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, Instrument};

use crate::chain::{
    AttachOptions, AttachStart, Chain, Notification, NotificationSender, StartCallback,
    Subscription,
};
use crate::error::IndexerError;
use crate::locator::{locator_heights, BlockLocator};
use crate::types::{BlockHash, BlockInfo, BlockKey};

struct Node {
    block: BlockInfo,
    have_data: bool,
}

struct Subscriber {
    id: u64,
    name: String,
    tx: NotificationSender,
    live: bool,
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<BlockHash, Node>,
    /// Active branch, indexed by height.
    active: Vec<BlockHash>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
    nonce: u64,
    prune_mode: bool,
}

impl Inner {
    fn tip(&self) -> Option<BlockKey> {
        let hash = self.active.last()?;
        Some(BlockKey::new(*hash, self.active.len() as u64 - 1))
    }

    fn is_active(&self, key: &BlockKey) -> bool {
        self.active.get(key.height as usize) == Some(&key.hash)
    }

    fn new_block(&mut self, parent: Option<BlockKey>, data: Vec<u8>) -> BlockKey {
        self.nonce += 1;
        let height = parent.map_or(0, |p| p.height + 1);
        let mut hash = [0u8; 32];
        hash[..8].copy_from_slice(&self.nonce.to_le_bytes());
        hash[8..16].copy_from_slice(&height.to_le_bytes());
        hash[31] = 0xb1;
        let block = BlockInfo {
            hash: BlockHash(hash),
            prev_hash: parent.map(|p| p.hash),
            height,
            data: Some(data.into()),
        };
        let key = block.key();
        self.blocks.insert(
            key.hash,
            Node {
                block,
                have_data: true,
            },
        );
        key
    }

    /// Block with its payload, or with `data: None` once pruned.
    fn block(&self, hash: &BlockHash) -> Option<BlockInfo> {
        let node = self.blocks.get(hash)?;
        Some(if node.have_data {
            node.block.clone()
        } else {
            node.block.header()
        })
    }

    fn ancestor(&self, hash: &BlockHash, height: u64) -> Option<BlockHash> {
        let mut block = &self.blocks.get(hash)?.block;
        while block.height > height {
            block = &self.blocks.get(&block.prev_hash?)?.block;
        }
        (block.height == height).then_some(block.hash)
    }

    /// Last block `key` shares with the active branch.
    fn fork_point(&self, key: &BlockKey) -> Option<BlockKey> {
        let mut cursor = *key;
        while !self.is_active(&cursor) {
            cursor = self.blocks.get(&cursor.hash)?.block.parent_key()?;
        }
        Some(cursor)
    }

    fn locator(&self, hash: &BlockHash) -> BlockLocator {
        let Some(node) = self.blocks.get(hash) else {
            return BlockLocator::null();
        };
        let hashes = locator_heights(node.block.height)
            .into_iter()
            .filter_map(|height| self.ancestor(hash, height))
            .collect();
        BlockLocator::new(hashes)
    }

    /// Send to every live subscriber, dropping those whose consumer is gone.
    fn broadcast(&mut self, notification: &Notification) {
        self.subscribers.retain(|sub| {
            if !sub.live {
                return true;
            }
            let delivered = sub.tx.send(notification.clone()).is_ok();
            if !delivered {
                debug!(subscriber = %sub.name, "dropping closed subscriber");
            }
            delivered
        });
    }

    fn subscriber(&self, id: u64) -> Option<&Subscriber> {
        self.subscribers.iter().find(|s| s.id == id)
    }

    fn unsubscribe(&mut self, id: u64) {
        self.subscribers.retain(|s| s.id != id);
    }
}

/// A chain held entirely in memory.
#[derive(Default, Clone)]
pub struct MemoryChain {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the active branch by one block and notify live subscribers.
    /// The first block pushed is genesis.
    pub fn push_block(&self, data: Vec<u8>) -> BlockKey {
        let mut inner = self.inner.lock();
        let parent = inner.tip();
        let key = inner.new_block(parent, data);
        inner.active.push(key.hash);
        if let Some(block) = inner.block(&key.hash) {
            inner.broadcast(&Notification::BlockConnected {
                block,
                is_tip: true,
                error: None,
            });
        }
        key
    }

    /// Build a side branch on top of `ancestor` without activating it.
    pub fn add_fork(
        &self,
        ancestor: &BlockHash,
        blocks: Vec<Vec<u8>>,
    ) -> Result<Vec<BlockKey>, IndexerError> {
        let mut inner = self.inner.lock();
        let mut parent = inner
            .blocks
            .get(ancestor)
            .map(|n| n.block.key())
            .ok_or_else(|| IndexerError::Chain(format!("unknown fork ancestor {ancestor}")))?;
        let mut keys = Vec::with_capacity(blocks.len());
        for data in blocks {
            parent = inner.new_block(Some(parent), data);
            keys.push(parent);
        }
        Ok(keys)
    }

    /// Make the branch ending at `tip` active.
    ///
    /// Live subscribers see the old blocks disconnected newest first, then
    /// the new ones connected oldest first.
    pub fn reorg_to(&self, tip: &BlockHash) -> Result<(), IndexerError> {
        let mut inner = self.inner.lock();
        let mut branch = Vec::new();
        let mut cursor = inner
            .blocks
            .get(tip)
            .map(|n| n.block.key())
            .ok_or_else(|| IndexerError::Chain(format!("unknown reorg target {tip}")))?;
        while !inner.is_active(&cursor) {
            branch.push(cursor.hash);
            let node = &inner.blocks[&cursor.hash];
            match node.block.parent_key() {
                Some(parent) => cursor = parent,
                None => {
                    return Err(IndexerError::Chain(format!(
                        "reorg target {tip} does not share genesis with the active branch"
                    )))
                }
            }
        }
        let fork_height = cursor.height;

        while inner.active.len() as u64 > fork_height + 1 {
            let Some(hash) = inner.active.pop() else { break };
            if let Some(block) = inner.block(&hash) {
                inner.broadcast(&Notification::BlockDisconnected { block, error: None });
            }
        }
        let new_tip_height = fork_height + branch.len() as u64;
        for hash in branch.into_iter().rev() {
            inner.active.push(hash);
            if let Some(block) = inner.block(&hash) {
                let is_tip = block.height == new_tip_height;
                inner.broadcast(&Notification::BlockConnected {
                    block,
                    is_tip,
                    error: None,
                });
            }
        }
        Ok(())
    }

    /// Notify live subscribers that chain state was flushed at the tip.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        let locator = match inner.tip() {
            Some(tip) => inner.locator(&tip.hash),
            None => BlockLocator::null(),
        };
        inner.broadcast(&Notification::ChainFlushed { locator });
    }

    /// Discard the data of active blocks below `height`.
    pub fn prune_below(&self, height: u64) {
        let mut inner = self.inner.lock();
        let pruned: Vec<BlockHash> = inner.active.iter().take(height as usize).copied().collect();
        for hash in pruned {
            if let Some(node) = inner.blocks.get_mut(&hash) {
                node.have_data = false;
            }
        }
    }

    pub fn set_prune_mode(&self, prune: bool) {
        self.inner.lock().prune_mode = prune;
    }

    pub fn tip_key(&self) -> Option<BlockKey> {
        self.inner.lock().tip()
    }

    /// Block by hash, with its payload unless pruned.
    pub fn block_with_data(&self, hash: &BlockHash) -> Option<BlockInfo> {
        self.inner.lock().block(hash)
    }

    /// The active branch from genesis to tip.
    pub fn active_blocks(&self) -> Vec<BlockInfo> {
        let inner = self.inner.lock();
        inner.active.iter().filter_map(|h| inner.block(h)).collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

#[async_trait]
impl Chain for MemoryChain {
    async fn attach(
        &self,
        notifications: NotificationSender,
        locator: &BlockLocator,
        options: &AttachOptions,
        on_start: StartCallback,
    ) -> Result<Box<dyn Subscription>, IndexerError> {
        let (start, id) = {
            let mut inner = self.inner.lock();
            let block = locator
                .hashes
                .iter()
                .find_map(|hash| inner.blocks.get(hash).map(|n| n.block.key()));
            let is_tip = match block {
                Some(block) => inner.tip() == Some(block),
                None => locator.is_null() && inner.active.is_empty(),
            };
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.push(Subscriber {
                id,
                name: options.name.clone(),
                tx: notifications,
                live: is_tip,
            });
            let start = AttachStart {
                locator_set: !locator.is_null(),
                block,
                is_tip,
            };
            (start, id)
        };
        debug!(subscriber = %options.name, ?start, "attaching");

        let cursor = start.block;
        if let Err(e) = on_start(start).await {
            self.inner.lock().unsubscribe(id);
            return Err(e);
        }
        Ok(Box::new(MemorySubscription {
            inner: self.inner.clone(),
            id,
            cursor,
            thread_name: options.thread_name.clone(),
            interrupted: Arc::new(AtomicBool::new(false)),
            driver: Mutex::new(None),
        }))
    }

    async fn find_block(&self, hash: &BlockHash) -> Option<BlockInfo> {
        self.inner.lock().blocks.get(hash).map(|n| n.block.header())
    }

    async fn find_ancestor_by_height(&self, hash: &BlockHash, height: u64) -> Option<BlockHash> {
        self.inner.lock().ancestor(hash, height)
    }

    async fn tip(&self) -> Option<BlockKey> {
        self.inner.lock().tip()
    }

    async fn get_locator(&self, hash: &BlockHash) -> BlockLocator {
        self.inner.lock().locator(hash)
    }

    async fn wait_for_pending_notifications(&self) {
        // Notifications are handed over synchronously.
    }

    async fn prune_mode(&self) -> bool {
        self.inner.lock().prune_mode
    }

    async fn has_data_from_tip_down(&self, start: Option<&BlockKey>) -> bool {
        let inner = self.inner.lock();
        let from = start
            .and_then(|s| inner.fork_point(s))
            .map_or(0, |fork| fork.height as usize + 1);
        inner
            .active
            .iter()
            .skip(from)
            .all(|hash| inner.blocks.get(hash).map_or(false, |n| n.have_data))
    }
}

// ─── Subscription ─────────────────────────────────────────────────────────────

struct MemorySubscription {
    inner: Arc<Mutex<Inner>>,
    id: u64,
    cursor: Option<BlockKey>,
    thread_name: String,
    interrupted: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    async fn start(&self) -> Result<(), IndexerError> {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return Ok(());
        }
        match self.inner.lock().subscriber(self.id) {
            None => return Err(IndexerError::Stopped),
            Some(sub) if sub.live => return Ok(()),
            Some(_) => {}
        }
        let span = info_span!("sync", thread = %self.thread_name);
        *driver = Some(tokio::spawn(
            drive(self.inner.clone(), self.id, self.cursor, self.interrupted.clone())
                .instrument(span),
        ));
        Ok(())
    }

    async fn close(&self) {
        self.interrupt();
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        self.inner.lock().unsubscribe(self.id);
    }
}

/// Catch one subscriber up to the tip, then switch it to live delivery.
async fn drive(
    inner: Arc<Mutex<Inner>>,
    id: u64,
    mut cursor: Option<BlockKey>,
    interrupted: Arc<AtomicBool>,
) {
    loop {
        if interrupted.load(Ordering::Acquire) {
            debug!(cursor = ?cursor, "catch-up interrupted");
            return;
        }
        {
            let mut inner = inner.lock();
            let Some(sub) = inner.subscriber(id) else { return };
            let tx = sub.tx.clone();

            let sent = match cursor {
                Some(at) if !inner.is_active(&at) => {
                    let Some(block) = inner.block(&at.hash) else { return };
                    cursor = block.parent_key();
                    tx.send(Notification::BlockDisconnected { block, error: None })
                }
                _ => {
                    let next = cursor.map_or(0, |c| c.height + 1);
                    match inner.active.get(next as usize).copied() {
                        Some(hash) => {
                            let Some(block) = inner.block(&hash) else { return };
                            let error = block
                                .data
                                .is_none()
                                .then(|| format!("failed to read block {hash} from disk"));
                            let is_tip = next as usize + 1 == inner.active.len();
                            cursor = Some(block.key());
                            tx.send(Notification::BlockConnected {
                                block,
                                is_tip,
                                error,
                            })
                        }
                        None => {
                            finish(&mut inner, id, cursor, &tx);
                            return;
                        }
                    }
                }
            };
            if sent.is_err() {
                inner.unsubscribe(id);
                return;
            }
        }
        tokio::task::yield_now().await;
    }
}

/// Send the closing marker and flush, then go live.
fn finish(inner: &mut Inner, id: u64, cursor: Option<BlockKey>, tx: &NotificationSender) {
    if let Some(at) = cursor {
        if let Some(block) = inner.block(&at.hash) {
            let _ = tx.send(Notification::BlockConnected {
                block: block.header(),
                is_tip: true,
                error: None,
            });
            let _ = tx.send(Notification::ChainFlushed {
                locator: inner.locator(&at.hash),
            });
        }
    }
    if let Some(sub) = inner.subscribers.iter_mut().find(|s| s.id == id) {
        sub.live = true;
    }
    debug!(tip = ?cursor, "caught up; delivering live");
}
