//! Fatal-error escalation.
//!
//! When an index can no longer vouch for its on-disk state the host process
//! must stop serving it. The engine interrupts itself and hands the
//! diagnostic to a [`FatalErrorHandler`].

use tokio::sync::watch;

/// Receives unrecoverable errors raised by an index engine.
pub trait FatalErrorHandler: Send + Sync {
    fn fatal_error(&self, message: &str);
}

/// Logs the message and aborts the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortProcess;

impl FatalErrorHandler for AbortProcess {
    fn fatal_error(&self, message: &str) {
        tracing::error!("*** {message}");
        tracing::error!("A fatal internal error occurred, aborting");
        std::process::abort();
    }
}

/// Publishes the first fatal message on a watch channel so the host can shut
/// down gracefully.
pub struct ShutdownSignal {
    tx: watch::Sender<Option<String>>,
}

impl ShutdownSignal {
    pub fn new() -> (Self, watch::Receiver<Option<String>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    /// A further receiver for the shutdown message.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }

    /// The recorded message, if shutdown was requested.
    pub fn message(&self) -> Option<String> {
        self.tx.borrow().clone()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new().0
    }
}

impl FatalErrorHandler for ShutdownSignal {
    fn fatal_error(&self, message: &str) {
        tracing::error!("*** {message}");
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(message.to_string());
            true
        });
    }
}
