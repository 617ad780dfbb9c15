//! IndexEngine — lifecycle and public surface of one secondary index.
//!
//! ```text
//!  init()  ── read checkpoint ── Chain::attach ──► spawn handler task
//!                                    │
//!                          on_start: resume point, extension.init()
//!
//!  start_background_sync() ── Subscription::start (catch-up driver)
//!  summary() / best_block() / is_synced()   lock-free reads
//!  block_until_synced_to_current_chain()    read-your-writes barrier
//!  interrupt() / stop()                     teardown
//! ```

use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::chain::{
    notification_channel, AttachOptions, AttachStart, Chain, NotificationSender, StartCallback,
    Subscription,
};
use crate::checkpoint;
use crate::config::{EngineConfig, EngineState};
use crate::error::IndexerError;
use crate::extension::IndexExtension;
use crate::fatal::FatalErrorHandler;
use crate::handler::{NotificationHandler, SyncState};
use crate::store::PersistentStore;
use crate::types::{BlockHash, BlockKey, IndexSummary};

/// Keeps one index in step with the chain.
///
/// Build one with [`EngineBuilder`](crate::builder::EngineBuilder).
pub struct IndexEngine {
    name: String,
    extension: Arc<dyn IndexExtension>,
    chain: Arc<dyn Chain>,
    store: Arc<dyn PersistentStore>,
    fatal: Arc<dyn FatalErrorHandler>,
    config: EngineConfig,
    state: Arc<SyncState>,
    lifecycle: Mutex<EngineState>,
    // Never held across an await.
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    notifications: Mutex<Option<NotificationSender>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IndexEngine {
    pub(crate) fn new(
        extension: Arc<dyn IndexExtension>,
        chain: Arc<dyn Chain>,
        store: Arc<dyn PersistentStore>,
        fatal: Arc<dyn FatalErrorHandler>,
        config: EngineConfig,
    ) -> Self {
        Self {
            name: extension.name().to_string(),
            extension,
            chain,
            store,
            fatal,
            config,
            state: Arc::new(SyncState::new()),
            lifecycle: Mutex::new(EngineState::Uninitialized),
            subscription: Mutex::new(None),
            notifications: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EngineState {
        *self.lifecycle.lock()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read the checkpoint, subscribe to the chain and start applying
    /// notifications.
    ///
    /// Fails with [`IndexerError::StaleCheckpoint`] or
    /// [`IndexerError::PruneViolation`] when the index has to be rebuilt.
    pub async fn init(&self) -> Result<(), IndexerError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                EngineState::Uninitialized => *lifecycle = EngineState::Initializing,
                EngineState::Stopped => return Err(IndexerError::Stopped),
                EngineState::Initializing | EngineState::Running => {
                    return Err(IndexerError::AlreadyInitialized)
                }
            }
        }

        match self.attach().await {
            Ok(()) => {
                *self.lifecycle.lock() = EngineState::Running;
                debug!(index = %self.name, synced = self.state.is_synced(), "index initialized");
                Ok(())
            }
            Err(e) => {
                self.state.interrupt();
                *self.lifecycle.lock() = EngineState::Stopped;
                Err(e)
            }
        }
    }

    async fn attach(&self) -> Result<(), IndexerError> {
        if self.chain.prune_mode().await && !self.extension.allow_prune() {
            return Err(IndexerError::PruneNotAllowed {
                index: self.name.clone(),
            });
        }

        let locator = checkpoint::read_checkpoint(self.store.as_ref())
            .await
            .unwrap_or_default();
        let options = AttachOptions {
            name: self.name.clone(),
            thread_name: self.extension.options().thread_name,
        };

        let (tx, rx) = notification_channel();
        let subscription: Arc<dyn Subscription> = self
            .chain
            .attach(tx.clone(), &locator, &options, self.on_start())
            .await?
            .into();

        let handler = NotificationHandler::new(
            self.extension.clone(),
            self.chain.clone(),
            self.store.clone(),
            self.state.clone(),
            self.fatal.clone(),
            &self.config,
        )
        .with_subscription(subscription.clone());
        let span = info_span!("index", thread = %options.thread_name);
        let worker = tokio::spawn(handler.run(rx).instrument(span));

        *self.subscription.lock() = Some(subscription);
        *self.notifications.lock() = Some(tx);
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    /// Runs once the chain has placed the checkpoint, before any
    /// notification is delivered.
    fn on_start(&self) -> StartCallback {
        let name = self.name.clone();
        let chain = self.chain.clone();
        let extension = self.extension.clone();
        let state = self.state.clone();
        let fatal = self.fatal.clone();

        Box::new(move |start: AttachStart| {
            async move {
                if start.locator_set && start.block.is_none() {
                    return Err(IndexerError::StaleCheckpoint { index: name });
                }
                if !start.is_tip && !chain.has_data_from_tip_down(start.block.as_ref()).await {
                    return Err(IndexerError::PruneViolation { index: name });
                }

                state.set_best_block(start.block);
                if let Err(e) = extension.init(start.block.as_ref()).await {
                    let reason = format!("failed to initialize index: {e}");
                    fatal.fatal_error(&format!("{name}: {reason}"));
                    return Err(IndexerError::Fatal {
                        index: name,
                        reason,
                    });
                }

                if start.is_tip {
                    state.set_synced();
                    let height = start.block.map_or(0, |b| b.height);
                    info!(index = %name, height, "{name} is enabled at height {height}");
                }
                Ok(())
            }
            .boxed()
        })
    }

    /// Start catching up in the background. A no-op once synced.
    pub async fn start_background_sync(&self) -> Result<(), IndexerError> {
        let lifecycle = self.state();
        match lifecycle {
            EngineState::Running => {}
            EngineState::Stopped => return Err(IndexerError::Stopped),
            EngineState::Uninitialized | EngineState::Initializing => {
                return Err(IndexerError::NotInitialized)
            }
        }
        if self.state.is_synced() {
            return Ok(());
        }
        let subscription = self
            .subscription
            .lock()
            .clone()
            .ok_or(IndexerError::NotInitialized)?;
        subscription.start().await
    }

    /// Stop future notifications. One already being applied completes.
    pub fn interrupt(&self) {
        self.state.interrupt();
        if let Some(subscription) = self.subscription.lock().as_ref() {
            subscription.interrupt();
        }
    }

    /// Interrupt, unsubscribe and wait for the handler task to finish.
    pub async fn stop(&self) {
        self.interrupt();

        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.close().await;
        }
        self.notifications.lock().take();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(index = %self.name, error = %e, "notification handler task failed");
            }
        }
        *self.lifecycle.lock() = EngineState::Stopped;
        debug!(index = %self.name, "index stopped");
    }

    pub fn best_block(&self) -> Option<BlockKey> {
        self.state.best_block()
    }

    pub fn is_synced(&self) -> bool {
        self.state.is_synced()
    }

    /// Never blocks, whatever the handler is doing.
    ///
    /// Reports height 0 and [`BlockHash::ZERO`] until a block is indexed.
    pub fn summary(&self) -> IndexSummary {
        let best = self.state.best_block();
        IndexSummary {
            name: self.name.clone(),
            synced: self.state.is_synced(),
            best_block_height: best.map_or(0, |b| b.height),
            best_block_hash: best.map_or(BlockHash::ZERO, |b| b.hash),
        }
    }

    /// Wait until the index reflects everything the chain has delivered.
    ///
    /// Returns `false` at once if the index is still catching up.
    pub async fn block_until_synced_to_current_chain(&self) -> bool {
        if !self.state.is_synced() {
            return false;
        }

        if let (Some(best), Some(tip)) = (self.state.best_block(), self.chain.tip().await) {
            if best.height >= tip.height
                && self
                    .chain
                    .find_ancestor_by_height(&best.hash, tip.height)
                    .await
                    == Some(tip.hash)
            {
                return true;
            }
        }

        info!(index = %self.name, "{}: catching up to the current chain", self.name);
        self.chain.wait_for_pending_notifications().await;
        let sender = self.notifications.lock().clone();
        if let Some(sender) = sender {
            sender.sync().await;
        }
        true
    }
}

impl Drop for IndexEngine {
    fn drop(&mut self) {
        self.interrupt();
    }
}

impl std::fmt::Debug for IndexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexEngine")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("best_block", &self.best_block())
            .field("synced", &self.is_synced())
            .finish()
    }
}
