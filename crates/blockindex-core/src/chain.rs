//! The chain service contract and the notification channel.
//!
//! The chain pushes ordered [`Notification`]s onto a single-consumer channel
//! that the engine drains serially. Nothing about ordering has to be
//! reasoned about across callbacks: one task, one queue, one event at a time.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use crate::error::IndexerError;
use crate::locator::BlockLocator;
use crate::types::{BlockHash, BlockInfo, BlockKey};

// ─── Notifications ────────────────────────────────────────────────────────────

/// An ordered chain event delivered to one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A block was connected. A block without `data` marks the start or the
    /// end of a catch-up run.
    BlockConnected {
        block: BlockInfo,
        /// `true` if the block is the chain tip at delivery time.
        is_tip: bool,
        error: Option<String>,
    },
    /// A block was disconnected by a reorg.
    BlockDisconnected {
        block: BlockInfo,
        error: Option<String>,
    },
    /// The chain flushed its own state; `locator` describes the last block
    /// delivered to this subscriber.
    ChainFlushed { locator: BlockLocator },
}

enum Envelope {
    Notify(Notification),
    Barrier(oneshot::Sender<()>),
}

/// Producer half of a notification channel. Cheap to clone.
#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Consumer half of a notification channel.
pub struct NotificationReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

/// Create an unbounded, ordered notification channel.
pub fn notification_channel() -> (NotificationSender, NotificationReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NotificationSender { tx }, NotificationReceiver { rx })
}

impl NotificationSender {
    /// Enqueue a notification. Fails once the consumer has gone away.
    pub fn send(&self, notification: Notification) -> Result<(), IndexerError> {
        self.tx
            .send(Envelope::Notify(notification))
            .map_err(|_| IndexerError::Stopped)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Wait until every notification sent before this call has been handled.
    ///
    /// Returns immediately if the consumer has gone away.
    pub async fn sync(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Envelope::Barrier(ack)).is_err() {
            return;
        }
        let _ = done.await;
    }
}

impl NotificationReceiver {
    /// Next notification, or `None` once every sender is gone.
    ///
    /// Barriers are acknowledged as they are reached, which is after the
    /// caller has finished with every earlier notification.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await? {
                Envelope::Notify(notification) => return Some(notification),
                Envelope::Barrier(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }

    /// Stop accepting new notifications; queued ones can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

// ─── Attach ───────────────────────────────────────────────────────────────────

/// Identity an index presents when subscribing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOptions {
    pub name: String,
    pub thread_name: String,
}

/// What the chain resolved a subscriber's locator to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachStart {
    /// `true` if the subscriber passed a non-null locator.
    pub locator_set: bool,
    /// Newest locator block the chain still knows; `None` = start from genesis
    /// (or, with `locator_set`, a checkpoint the chain cannot place).
    pub block: Option<BlockKey>,
    /// `true` if `block` is already the active tip.
    pub is_tip: bool,
}

/// Callback run by [`Chain::attach`] once the start point is resolved and
/// before any notification is delivered. An `Err` aborts the attach.
pub type StartCallback =
    Box<dyn FnOnce(AttachStart) -> BoxFuture<'static, Result<(), IndexerError>> + Send>;

/// Handle on a live chain subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Stop delivering notifications. Does not wait for one in progress.
    fn interrupt(&self);

    /// Start the catch-up driver for a subscriber that is behind the tip.
    async fn start(&self) -> Result<(), IndexerError>;

    /// Release the subscription, waiting for the catch-up driver to exit.
    async fn close(&self);
}

/// The authoritative chain, as seen by an index.
#[async_trait]
pub trait Chain: Send + Sync + 'static {
    /// Subscribe `notifications` to chain events, resuming from `locator`.
    async fn attach(
        &self,
        notifications: NotificationSender,
        locator: &BlockLocator,
        options: &AttachOptions,
        on_start: StartCallback,
    ) -> Result<Box<dyn Subscription>, IndexerError>;

    /// Header lookup by hash, on any branch.
    async fn find_block(&self, hash: &BlockHash) -> Option<BlockInfo>;

    /// Hash of the ancestor of `hash` at `height`.
    async fn find_ancestor_by_height(&self, hash: &BlockHash, height: u64) -> Option<BlockHash>;

    /// The active tip.
    async fn tip(&self) -> Option<BlockKey>;

    /// Locator for the block `hash`; null if the block is unknown.
    async fn get_locator(&self, hash: &BlockHash) -> BlockLocator;

    /// Wait until every notification the chain has queued has been handed to
    /// its subscribers.
    async fn wait_for_pending_notifications(&self);

    /// Whether the chain discards old block data.
    async fn prune_mode(&self) -> bool {
        false
    }

    /// Whether block data is available from the tip down to `start`
    /// (down to genesis when `start` is `None`). For a `start` off the
    /// active branch the walk goes down to the fork point instead.
    async fn has_data_from_tip_down(&self, _start: Option<&BlockKey>) -> bool {
        true
    }
}
