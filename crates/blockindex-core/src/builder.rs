//! Fluent builder API for creating index engines.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blockindex_core::{EngineBuilder, MemoryChain, MemoryStore, ShutdownSignal};
//! # use blockindex_core::{BlockInfo, IndexExtension, IndexerError};
//! # struct TxIndex;
//! # #[async_trait::async_trait]
//! # impl IndexExtension for TxIndex {
//! #     fn name(&self) -> &str { "txindex" }
//! #     async fn append(&self, _: &BlockInfo) -> Result<(), IndexerError> { Ok(()) }
//! # }
//!
//! let (signal, _shutdown) = ShutdownSignal::new();
//! let engine = EngineBuilder::new(
//!     Arc::new(TxIndex),
//!     Arc::new(MemoryChain::new()),
//!     Arc::new(MemoryStore::new()),
//! )
//! .locator_write_interval_ms(10_000)
//! .fatal_handler(Arc::new(signal))
//! .build();
//! ```

use std::sync::Arc;

use crate::chain::Chain;
use crate::config::EngineConfig;
use crate::engine::IndexEngine;
use crate::extension::IndexExtension;
use crate::fatal::{AbortProcess, FatalErrorHandler};
use crate::store::PersistentStore;

/// Fluent builder for [`IndexEngine`].
pub struct EngineBuilder {
    extension: Arc<dyn IndexExtension>,
    chain: Arc<dyn Chain>,
    store: Arc<dyn PersistentStore>,
    fatal: Arc<dyn FatalErrorHandler>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new(
        extension: Arc<dyn IndexExtension>,
        chain: Arc<dyn Chain>,
        store: Arc<dyn PersistentStore>,
    ) -> Self {
        Self {
            extension,
            chain,
            store,
            fatal: Arc::new(AbortProcess),
            config: EngineConfig::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how often the checkpoint advances while catching up.
    pub fn locator_write_interval_ms(mut self, ms: u64) -> Self {
        self.config.locator_write_interval_ms = ms;
        self
    }

    /// Set how often catch-up progress is logged.
    pub fn sync_log_interval_ms(mut self, ms: u64) -> Self {
        self.config.sync_log_interval_ms = ms;
        self
    }

    /// Set where fatal errors go. Defaults to [`AbortProcess`].
    pub fn fatal_handler(mut self, handler: Arc<dyn FatalErrorHandler>) -> Self {
        self.fatal = handler;
        self
    }

    /// Build the engine. Call [`IndexEngine::init`] next.
    pub fn build(self) -> IndexEngine {
        IndexEngine::new(
            self.extension,
            self.chain,
            self.store,
            self.fatal,
            self.config,
        )
    }
}
