//! Notification handler — applies chain events to an index, in order.
//!
//! The handler is the only writer of the index's progress. It runs on a
//! single task that drains the notification channel, so its rewind
//! bookkeeping (`rewind_start`, `rewind_error`) needs no locking; only the
//! best block and the synced flag are shared with readers, through
//! [`SyncState`].

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain::{Chain, Notification, NotificationReceiver, Subscription};
use crate::checkpoint;
use crate::config::EngineConfig;
use crate::extension::IndexExtension;
use crate::fatal::FatalErrorHandler;
use crate::locator::BlockLocator;
use crate::store::PersistentStore;
use crate::types::{BlockInfo, BlockKey};

// ─── SyncState ────────────────────────────────────────────────────────────────

/// Progress shared between the handler task and readers.
///
/// Readers never block: the best block is swapped atomically as a whole and
/// the synced flag is a plain atomic.
pub(crate) struct SyncState {
    best_block: ArcSwapOption<BlockKey>,
    synced: AtomicBool,
    interrupted: watch::Sender<bool>,
}

impl SyncState {
    pub(crate) fn new() -> Self {
        let (interrupted, _) = watch::channel(false);
        Self {
            best_block: ArcSwapOption::empty(),
            synced: AtomicBool::new(false),
            interrupted,
        }
    }

    pub(crate) fn best_block(&self) -> Option<BlockKey> {
        self.best_block.load().as_deref().copied()
    }

    pub(crate) fn set_best_block(&self, block: Option<BlockKey>) {
        self.best_block.store(block.map(Arc::new));
    }

    pub(crate) fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub(crate) fn set_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.send_replace(true);
    }

    #[cfg(test)]
    pub(crate) fn is_interrupted(&self) -> bool {
        *self.interrupted.borrow()
    }

    fn watch_interrupt(&self) -> watch::Receiver<bool> {
        self.interrupted.subscribe()
    }
}

// ─── NotificationHandler ──────────────────────────────────────────────────────

pub(crate) struct NotificationHandler {
    name: String,
    extension: Arc<dyn IndexExtension>,
    chain: Arc<dyn Chain>,
    store: Arc<dyn PersistentStore>,
    state: Arc<SyncState>,
    fatal: Arc<dyn FatalErrorHandler>,
    /// Interrupted on a fatal error so the chain stops delivering.
    subscription: Option<Arc<dyn Subscription>>,
    locator_write_interval: Duration,
    sync_log_interval: Duration,
    /// Last block reflected in the extension's state. Runs ahead of the
    /// published best block while catching up.
    applied: Option<BlockKey>,
    /// First block disconnected since the last successful commit.
    rewind_start: Option<BlockKey>,
    /// A `remove` failed during the current rewind episode.
    rewind_error: bool,
    last_locator_write: Option<Instant>,
    last_log: Option<Instant>,
}

impl NotificationHandler {
    pub(crate) fn new(
        extension: Arc<dyn IndexExtension>,
        chain: Arc<dyn Chain>,
        store: Arc<dyn PersistentStore>,
        state: Arc<SyncState>,
        fatal: Arc<dyn FatalErrorHandler>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            name: extension.name().to_string(),
            applied: state.best_block(),
            extension,
            chain,
            store,
            state,
            fatal,
            subscription: None,
            locator_write_interval: config.locator_write_interval(),
            sync_log_interval: config.sync_log_interval(),
            rewind_start: None,
            rewind_error: false,
            last_locator_write: None,
            last_log: None,
        }
    }

    pub(crate) fn with_subscription(mut self, subscription: Arc<dyn Subscription>) -> Self {
        self.subscription = Some(subscription);
        self
    }

    /// Drain `notifications` until interrupted, the channel closes, or a
    /// fatal error occurs. A notification already being handled always
    /// runs to completion.
    pub(crate) async fn run(mut self, mut notifications: NotificationReceiver) {
        let mut interrupted = self.state.watch_interrupt();
        loop {
            let notification = tokio::select! {
                biased;
                _ = until_interrupted(&mut interrupted) => break,
                next = notifications.recv() => match next {
                    Some(notification) => notification,
                    None => break,
                },
            };
            if self.handle(notification).await.is_break() {
                break;
            }
        }
        notifications.close();
        debug!(index = %self.name, "notification handler stopped");
    }

    pub(crate) async fn handle(&mut self, notification: Notification) -> ControlFlow<()> {
        match notification {
            Notification::BlockConnected {
                block,
                is_tip,
                error,
            } => self.block_connected(block, is_tip, error).await,
            Notification::BlockDisconnected { block, error } => {
                self.block_disconnected(block, error).await
            }
            Notification::ChainFlushed { locator } => {
                self.chain_flushed(locator).await;
                ControlFlow::Continue(())
            }
        }
    }

    async fn block_connected(
        &mut self,
        block: BlockInfo,
        is_tip: bool,
        error: Option<String>,
    ) -> ControlFlow<()> {
        if let Some(error) = error {
            return self.fatal(format!("{}: {error}", self.name));
        }
        let Some(header) = self.chain.find_block(&block.hash).await else {
            return self.fatal(format!(
                "{}: block {} not found in the chain index",
                self.name, block.hash
            ));
        };
        let key = header.key();

        if block.data.is_none() {
            // Start or end of a catch-up run: nothing to append.
            self.applied = Some(key);
            self.state.set_best_block(Some(key));
            if is_tip && !self.state.is_synced() {
                self.state.set_synced();
                info!(index = %self.name, height = key.height, "{} is enabled at height {}", self.name, key.height);
            }
            return ControlFlow::Continue(());
        }

        if self.rewind_error {
            return self.fatal(format!(
                "{}: failed to rewind index to a previous chain tip before block {}",
                self.name, key.hash
            ));
        }

        match self.applied {
            None if header.height != 0 => {
                return self.fatal(format!(
                    "{}: first block connected is not the genesis block (height={})",
                    self.name, header.height
                ));
            }
            Some(applied) if !header.extends(&applied) => {
                warn!(
                    index = %self.name,
                    block = %key.hash,
                    applied = %applied.hash,
                    "block does not connect to the index's best chain; not updating index"
                );
                return ControlFlow::Continue(());
            }
            _ => {}
        }

        if self.rewind_start.is_some() {
            let locator = self.locator_for(self.applied).await;
            if let Err(e) = self.commit(&locator).await {
                return self.fatal(format!(
                    "{}: failed to commit rewound state before block {}: {e}",
                    self.name, key.hash
                ));
            }
            self.clear_rewind();
        }

        if let Err(e) = self.extension.append(&block).await {
            return self.fatal(format!(
                "{}: failed to write block {} to index database: {e}",
                self.name, key.hash
            ));
        }
        self.applied = Some(key);

        if self.state.is_synced() {
            self.state.set_best_block(Some(key));
            return ControlFlow::Continue(());
        }

        let now = Instant::now();
        if is_due(self.last_log, self.sync_log_interval, now) {
            info!(index = %self.name, height = key.height, "Syncing {} with block chain from height {}", self.name, key.height);
            self.last_log = Some(now);
        }
        if is_due(self.last_locator_write, self.locator_write_interval, now) {
            self.last_locator_write = Some(now);
            let locator = self.chain.get_locator(&key.hash).await;
            match self.commit(&locator).await {
                Ok(()) => self.state.set_best_block(Some(key)),
                Err(e) => warn!(index = %self.name, error = %e, "Failed to commit latest index state"),
            }
        }
        ControlFlow::Continue(())
    }

    async fn block_disconnected(&mut self, block: BlockInfo, error: Option<String>) -> ControlFlow<()> {
        if let Some(error) = error {
            return self.fatal(format!("{}: {error}", self.name));
        }
        let key = block.key();
        if self.rewind_error {
            debug!(index = %self.name, block = %key.hash, "rewind already failed; skipping remove");
            return ControlFlow::Continue(());
        }
        if self.applied != Some(key) {
            warn!(
                index = %self.name,
                block = %key.hash,
                "disconnected block is not the index's best block; ignoring"
            );
            return ControlFlow::Continue(());
        }

        if self.rewind_start.is_none() {
            self.rewind_start = Some(key);
        }

        match self.extension.remove(&block).await {
            Ok(()) => {
                let parent = block.parent_key();
                self.applied = parent;
                // While catching up the published block lags; only ever lower it here.
                let lowers = match (parent, self.state.best_block()) {
                    (_, None) => false,
                    (None, Some(_)) => true,
                    (Some(parent), Some(published)) => parent.height < published.height,
                };
                if self.state.is_synced() || lowers {
                    self.state.set_best_block(parent);
                }
            }
            Err(e) => {
                error!(index = %self.name, block = %key.hash, error = %e, "failed to remove block from index");
                self.rewind_error = true;
            }
        }
        ControlFlow::Continue(())
    }

    async fn chain_flushed(&mut self, locator: BlockLocator) {
        let locator = match self.applied {
            Some(applied) if locator.tip() == Some(&applied.hash) => locator,
            applied => self.locator_for(applied).await,
        };

        match self.commit(&locator).await {
            Ok(()) => {
                self.clear_rewind();
                if !self.state.is_synced() && self.applied.is_some() {
                    self.last_locator_write = Some(Instant::now());
                    self.state.set_best_block(self.applied);
                }
            }
            Err(e) => {
                if let Some(rewind_start) = self.rewind_start {
                    warn!(
                        index = %self.name,
                        error = %e,
                        rewind_start = %rewind_start,
                        "Failed to commit rewind; rolling best block back"
                    );
                    self.state.set_best_block(Some(rewind_start));
                } else {
                    warn!(index = %self.name, error = %e, "Failed to commit latest index state");
                }
            }
        }
    }

    async fn commit(&self, locator: &BlockLocator) -> Result<(), crate::error::IndexerError> {
        checkpoint::commit(self.store.as_ref(), self.extension.as_ref(), locator).await
    }

    async fn locator_for(&self, block: Option<BlockKey>) -> BlockLocator {
        match block {
            Some(block) => self.chain.get_locator(&block.hash).await,
            None => BlockLocator::null(),
        }
    }

    fn clear_rewind(&mut self) {
        self.rewind_start = None;
        self.rewind_error = false;
    }

    fn fatal(&self, message: String) -> ControlFlow<()> {
        error!(index = %self.name, "{message}");
        self.state.interrupt();
        if let Some(subscription) = &self.subscription {
            subscription.interrupt();
        }
        self.fatal.fatal_error(&message);
        ControlFlow::Break(())
    }

    #[cfg(test)]
    fn rewind_pending(&self) -> bool {
        self.rewind_start.is_some()
    }
}

async fn until_interrupted(interrupted: &mut watch::Receiver<bool>) {
    let _ = interrupted.wait_for(|stop| *stop).await;
}

fn is_due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    last.map_or(true, |last| now.duration_since(last) >= interval)
}
