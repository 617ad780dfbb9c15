//! End-to-end engine tests against the in-memory chain and store.
//!
//! Each test drives a `MemoryChain` (pushes, forks, reorgs, flushes) and
//! checks what a `TxIndex` extension saw, what landed in the store, and
//! what readers of the engine observe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use blockindex_core::checkpoint::{read_checkpoint, write_checkpoint};
use blockindex_core::{
    BatchOp, BlockHash, BlockInfo, BlockKey, BlockLocator, EngineBuilder, EngineState, IndexEngine,
    IndexExtension, IndexerError, MemoryChain, MemoryStore, PersistentStore, ShutdownSignal,
    WriteBatch,
};

// ─── Helpers ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Init(Option<u64>),
    Append(u64),
    Remove(u64),
}

/// Maps height → block hash under `t<height>`.
///
/// Writes are journaled and the whole journal is replayed into every
/// commit, so a failed batch loses nothing.
#[derive(Default)]
struct TxIndex {
    calls: Mutex<Vec<Call>>,
    pending: Mutex<WriteBatch>,
    fail_append_at: Option<u64>,
    fail_init: bool,
    allow_prune: bool,
    slow: bool,
}

fn record_key(height: u64) -> Vec<u8> {
    let mut key = b"t".to_vec();
    key.extend_from_slice(&height.to_be_bytes());
    key
}

impl TxIndex {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn appends(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Append(h) => Some(h),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl IndexExtension for TxIndex {
    fn name(&self) -> &str {
        "txindex"
    }

    fn allow_prune(&self) -> bool {
        self.allow_prune
    }

    async fn init(&self, resume_point: Option<&BlockKey>) -> Result<(), IndexerError> {
        self.calls.lock().push(Call::Init(resume_point.map(|b| b.height)));
        if self.fail_init {
            return Err(IndexerError::extension("txindex", "cannot open records"));
        }
        Ok(())
    }

    async fn append(&self, block: &BlockInfo) -> Result<(), IndexerError> {
        if self.slow {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.fail_append_at == Some(block.height) {
            return Err(IndexerError::extension("txindex", "disk full"));
        }
        self.calls.lock().push(Call::Append(block.height));
        self.pending
            .lock()
            .put(record_key(block.height), block.hash.as_bytes().to_vec());
        Ok(())
    }

    async fn remove(&self, block: &BlockInfo) -> Result<(), IndexerError> {
        self.calls.lock().push(Call::Remove(block.height));
        self.pending.lock().delete(record_key(block.height));
        Ok(())
    }

    async fn commit(&self, batch: &mut WriteBatch) -> Result<(), IndexerError> {
        for op in self.pending.lock().ops() {
            match op.clone() {
                BatchOp::Put { key, value } => batch.put(key, value),
                BatchOp::Delete { key } => batch.delete(key),
            }
        }
        Ok(())
    }
}

struct Harness {
    chain: Arc<MemoryChain>,
    store: Arc<MemoryStore>,
    ext: Arc<TxIndex>,
    signal: Arc<ShutdownSignal>,
    engine: IndexEngine,
}

fn harness_with(chain: Arc<MemoryChain>, store: Arc<MemoryStore>, ext: TxIndex) -> Harness {
    let ext = Arc::new(ext);
    let (signal, _rx) = ShutdownSignal::new();
    let signal = Arc::new(signal);
    let engine = EngineBuilder::new(ext.clone(), chain.clone(), store.clone())
        .locator_write_interval_ms(60_000)
        .fatal_handler(signal.clone())
        .build();
    Harness {
        chain,
        store,
        ext,
        signal,
        engine,
    }
}

fn harness(ext: TxIndex) -> Harness {
    harness_with(
        Arc::new(MemoryChain::new()),
        Arc::new(MemoryStore::new()),
        ext,
    )
}

fn push_blocks(chain: &MemoryChain, n: u8) -> Vec<BlockKey> {
    (0..n).map(|i| chain.push_block(vec![i])).collect()
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn checkpoint_tip(store: &MemoryStore) -> Option<BlockHash> {
    read_checkpoint(store).await.and_then(|l| l.tip().copied())
}

fn record_heights(store: &MemoryStore) -> Vec<u64> {
    store
        .scan_prefix(b"t")
        .into_iter()
        .map(|(k, _)| {
            let mut height = [0u8; 8];
            height.copy_from_slice(&k[1..]);
            u64::from_be_bytes(height)
        })
        .collect()
}

// ─── Catch-up and live following ──────────────────────────────────────────────

#[tokio::test]
async fn fresh_index_catches_up_then_follows_tip() {
    let h = harness(TxIndex::default());
    let blocks = push_blocks(&h.chain, 4);

    h.engine.init().await.unwrap();
    assert_eq!(h.engine.state(), EngineState::Running);
    assert!(!h.engine.is_synced());
    assert!(!h.engine.block_until_synced_to_current_chain().await);

    h.engine.start_background_sync().await.unwrap();
    wait_for("sync", || h.engine.is_synced()).await;

    assert_eq!(h.engine.best_block(), Some(blocks[3]));
    assert_eq!(h.ext.calls()[0], Call::Init(None));
    assert_eq!(h.ext.appends(), vec![0, 1, 2, 3]);
    // Reaching the tip is always made durable.
    wait_for("final checkpoint", || {
        record_heights(&h.store) == vec![0, 1, 2, 3]
    })
    .await;
    assert_eq!(checkpoint_tip(&h.store).await, Some(blocks[3].hash));

    let next = h.chain.push_block(vec![9]);
    assert!(h.engine.block_until_synced_to_current_chain().await);
    assert_eq!(h.engine.best_block(), Some(next));

    let summary = h.engine.summary();
    assert_eq!(summary.name, "txindex");
    assert!(summary.synced);
    assert_eq!(summary.best_block_height, 4);
    assert_eq!(summary.best_block_hash, next.hash);

    h.engine.stop().await;
    assert_eq!(h.engine.state(), EngineState::Stopped);
    assert_eq!(h.chain.subscriber_count(), 0);
}

#[tokio::test]
async fn empty_chain_is_synced_at_init() {
    let h = harness(TxIndex::default());
    h.engine.init().await.unwrap();
    assert!(h.engine.is_synced());

    let summary = h.engine.summary();
    assert_eq!(summary.best_block_height, 0);
    assert_eq!(summary.best_block_hash, BlockHash::ZERO);

    // Starting a synced index does nothing.
    h.engine.start_background_sync().await.unwrap();

    let genesis = h.chain.push_block(vec![0]);
    assert!(h.engine.block_until_synced_to_current_chain().await);
    assert_eq!(h.engine.best_block(), Some(genesis));
    assert_eq!(h.ext.appends(), vec![0]);
    h.engine.stop().await;
}

#[tokio::test]
async fn summary_never_blocks_while_catching_up() {
    let h = harness(TxIndex {
        slow: true,
        ..TxIndex::default()
    });
    push_blocks(&h.chain, 30);
    h.engine.init().await.unwrap();
    h.engine.start_background_sync().await.unwrap();

    let started = std::time::Instant::now();
    let summary = h.engine.summary();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(!summary.synced);
    assert!(!h.engine.block_until_synced_to_current_chain().await);

    h.engine.stop().await;
    assert!(h.ext.appends().len() < 30);
}

// ─── Restart ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn restart_resumes_from_checkpoint() {
    let first = harness(TxIndex::default());
    push_blocks(&first.chain, 4);
    first.engine.init().await.unwrap();
    first.engine.start_background_sync().await.unwrap();
    wait_for("sync", || first.engine.is_synced()).await;
    wait_for("checkpoint", || first.store.scan_prefix(b"t").len() == 4).await;
    first.engine.stop().await;

    let offline: Vec<_> = (0..2).map(|i| first.chain.push_block(vec![i])).collect();

    let second = harness_with(
        first.chain.clone(),
        first.store.clone(),
        TxIndex::default(),
    );
    second.engine.init().await.unwrap();
    assert_eq!(second.ext.calls()[0], Call::Init(Some(3)));
    assert_eq!(second.engine.best_block().map(|b| b.height), Some(3));

    second.engine.start_background_sync().await.unwrap();
    wait_for("sync", || second.engine.is_synced()).await;
    assert_eq!(second.ext.appends(), vec![4, 5]);
    assert_eq!(second.engine.best_block(), Some(offline[1]));
    second.engine.stop().await;
}

#[tokio::test]
async fn restart_after_offline_reorg_rewinds_stale_branch() {
    let first = harness(TxIndex::default());
    let blocks = push_blocks(&first.chain, 4);
    first.engine.init().await.unwrap();
    first.engine.start_background_sync().await.unwrap();
    wait_for("sync", || first.engine.is_synced()).await;
    wait_for("checkpoint", || first.store.scan_prefix(b"t").len() == 4).await;
    first.engine.stop().await;

    let fork = first
        .chain
        .add_fork(&blocks[1].hash, vec![vec![20], vec![21], vec![22]])
        .unwrap();
    first.chain.reorg_to(&fork[2].hash).unwrap();

    let second = harness_with(
        first.chain.clone(),
        first.store.clone(),
        TxIndex::default(),
    );
    second.engine.init().await.unwrap();
    second.engine.start_background_sync().await.unwrap();
    wait_for("sync", || second.engine.is_synced()).await;

    assert_eq!(
        second.ext.calls(),
        vec![
            Call::Init(Some(3)),
            Call::Remove(3),
            Call::Remove(2),
            Call::Append(2),
            Call::Append(3),
            Call::Append(4),
        ]
    );
    assert_eq!(second.engine.best_block(), Some(fork[2]));
    wait_for("checkpoint", || record_heights(&second.store) == vec![0, 1, 2, 3, 4]).await;
    assert_eq!(checkpoint_tip(&second.store).await, Some(fork[2].hash));
    second.engine.stop().await;
}

// ─── Live reorg ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn live_reorg_removes_then_appends() {
    let h = harness(TxIndex::default());
    h.engine.init().await.unwrap();
    let blocks = push_blocks(&h.chain, 4);
    assert!(h.engine.block_until_synced_to_current_chain().await);

    let fork = h
        .chain
        .add_fork(&blocks[2].hash, vec![vec![30], vec![31]])
        .unwrap();
    h.chain.reorg_to(&fork[1].hash).unwrap();
    assert!(h.engine.block_until_synced_to_current_chain().await);
    assert_eq!(h.engine.best_block(), Some(fork[1]));

    let calls = h.ext.calls();
    assert_eq!(
        &calls[calls.len() - 3..],
        &[Call::Remove(3), Call::Append(3), Call::Append(4)]
    );

    h.chain.flush();
    wait_for("flush", || record_heights(&h.store) == vec![0, 1, 2, 3, 4]).await;
    assert_eq!(checkpoint_tip(&h.store).await, Some(fork[1].hash));
    assert!(h.signal.message().is_none());
    h.engine.stop().await;
}

#[tokio::test]
async fn flush_failure_keeps_index_running() {
    let h = harness(TxIndex::default());
    h.engine.init().await.unwrap();
    push_blocks(&h.chain, 3);
    assert!(h.engine.block_until_synced_to_current_chain().await);

    h.store.fail_writes(true);
    h.chain.flush();
    let next = h.chain.push_block(vec![7]);
    assert!(h.engine.block_until_synced_to_current_chain().await);
    assert_eq!(h.engine.best_block(), Some(next));
    assert!(checkpoint_tip(&h.store).await.is_none());

    h.store.fail_writes(false);
    h.chain.flush();
    wait_for("flush", || record_heights(&h.store).len() == 4).await;
    assert_eq!(checkpoint_tip(&h.store).await, Some(next.hash));
    h.engine.stop().await;
}

// ─── Rebuild conditions ───────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_checkpoint_requires_rebuild() {
    let h = harness(TxIndex::default());
    push_blocks(&h.chain, 3);

    let mut batch = WriteBatch::new();
    write_checkpoint(&mut batch, &BlockLocator::new(vec![BlockHash([0xee; 32])]));
    h.store.write_batch(batch).await.unwrap();

    let err = h.engine.init().await.unwrap_err();
    assert!(matches!(err, IndexerError::StaleCheckpoint { .. }));
    assert!(err.requires_rebuild());
    assert_eq!(h.engine.state(), EngineState::Stopped);
    assert_eq!(h.chain.subscriber_count(), 0);
    assert!(h.ext.calls().is_empty());
}

#[tokio::test]
async fn pruning_chain_rejects_index_that_forbids_it() {
    let h = harness(TxIndex::default());
    h.chain.set_prune_mode(true);
    let err = h.engine.init().await.unwrap_err();
    assert!(matches!(err, IndexerError::PruneNotAllowed { .. }));
}

#[tokio::test]
async fn pruned_history_is_a_prune_violation() {
    let h = harness(TxIndex {
        allow_prune: true,
        ..TxIndex::default()
    });
    push_blocks(&h.chain, 5);
    h.chain.set_prune_mode(true);
    h.chain.prune_below(3);

    let err = h.engine.init().await.unwrap_err();
    assert!(matches!(err, IndexerError::PruneViolation { .. }));
    assert!(err.to_string().starts_with("txindex:"));
}

#[tokio::test]
async fn stale_branch_resume_over_pruned_fork_is_a_prune_violation() {
    let first = harness(TxIndex::default());
    let blocks = push_blocks(&first.chain, 4);
    first.engine.init().await.unwrap();
    first.engine.start_background_sync().await.unwrap();
    wait_for("sync", || first.engine.is_synced()).await;
    wait_for("checkpoint", || first.store.scan_prefix(b"t").len() == 4).await;
    first.engine.stop().await;

    let fork = first
        .chain
        .add_fork(&blocks[0].hash, (10..15u8).map(|i| vec![i]).collect())
        .unwrap();
    first.chain.reorg_to(&fork[4].hash).unwrap();
    first.chain.set_prune_mode(true);
    first.chain.prune_below(4);

    let second = harness_with(
        first.chain.clone(),
        first.store.clone(),
        TxIndex {
            allow_prune: true,
            ..TxIndex::default()
        },
    );
    let err = second.engine.init().await.unwrap_err();
    assert!(matches!(err, IndexerError::PruneViolation { .. }));
    assert_eq!(second.engine.state(), EngineState::Stopped);
    assert!(second.ext.calls().is_empty());
    assert_eq!(second.signal.message(), None);
}

// ─── Fatal errors ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn append_failure_is_fatal() {
    let h = harness(TxIndex {
        fail_append_at: Some(2),
        ..TxIndex::default()
    });
    push_blocks(&h.chain, 5);
    h.engine.init().await.unwrap();
    h.engine.start_background_sync().await.unwrap();

    let signal = h.signal.clone();
    wait_for("fatal error", || signal.message().is_some()).await;
    let message = h.signal.message().unwrap_or_default();
    assert!(message.contains("txindex"));
    assert!(message.contains("failed to write block"));

    assert_eq!(h.ext.appends(), vec![0, 1]);
    assert!(!h.engine.is_synced());
    h.engine.stop().await;
}

#[tokio::test]
async fn extension_init_failure_is_fatal() {
    let h = harness(TxIndex {
        fail_init: true,
        ..TxIndex::default()
    });
    push_blocks(&h.chain, 2);
    let err = h.engine.init().await.unwrap_err();
    assert!(matches!(err, IndexerError::Fatal { .. }));
    assert!(h.signal.message().is_some());
    assert_eq!(h.engine.state(), EngineState::Stopped);
}

// ─── Lifecycle ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn lifecycle_misuse_is_reported() {
    let h = harness(TxIndex::default());
    push_blocks(&h.chain, 2);
    let summary = h.engine.summary();
    assert_eq!(summary.best_block_height, 0);
    assert_eq!(summary.best_block_hash, BlockHash::ZERO);
    assert!(matches!(
        h.engine.start_background_sync().await,
        Err(IndexerError::NotInitialized)
    ));

    h.engine.init().await.unwrap();
    assert!(matches!(
        h.engine.init().await,
        Err(IndexerError::AlreadyInitialized)
    ));

    h.engine.interrupt();
    h.engine.interrupt();
    h.engine.stop().await;
    assert!(matches!(h.engine.init().await, Err(IndexerError::Stopped)));
    assert!(matches!(
        h.engine.start_background_sync().await,
        Err(IndexerError::Stopped)
    ));
}

#[tokio::test]
async fn interrupted_index_ignores_new_blocks() {
    let h = harness(TxIndex::default());
    h.engine.init().await.unwrap();
    let genesis = h.chain.push_block(vec![0]);
    assert!(h.engine.block_until_synced_to_current_chain().await);

    h.engine.interrupt();
    h.chain.push_block(vec![1]);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.ext.appends(), vec![0]);
    assert_eq!(h.engine.best_block(), Some(genesis));
    h.engine.stop().await;
}
