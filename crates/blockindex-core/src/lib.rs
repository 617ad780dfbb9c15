//! blockindex-core — keeps secondary indexes in step with a block chain.
//!
//! # Architecture
//!
//! ```text
//! EngineBuilder → IndexEngine
//!                     ├── Chain::attach        (resume from the persisted locator)
//!                     ├── NotificationHandler  (one task, ordered connect / disconnect / flush)
//!                     │       └── IndexExtension   (append / remove / commit hooks)
//!                     ├── checkpoint::commit   (extension writes + locator, one batch)
//!                     └── PersistentStore      (memory / SQLite)
//! ```
//!
//! Readers (`summary`, `best_block`, `is_synced`) never block; the best
//! block only advances once the state it names is durable or the index is
//! following the tip.

pub mod builder;
pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod extension;
pub mod fatal;
mod handler;
pub mod locator;
pub mod logging;
pub mod memory_chain;
pub mod store;
pub mod types;

pub use builder::EngineBuilder;
pub use chain::{
    notification_channel, AttachOptions, AttachStart, Chain, Notification, NotificationReceiver,
    NotificationSender, StartCallback, Subscription,
};
pub use checkpoint::DB_BEST_BLOCK;
pub use config::{EngineConfig, EngineState};
pub use engine::IndexEngine;
pub use error::IndexerError;
pub use extension::{ExtensionOptions, IndexExtension};
pub use fatal::{AbortProcess, FatalErrorHandler, ShutdownSignal};
pub use locator::BlockLocator;
pub use logging::{init_tracing, try_init_tracing, LogConfig};
pub use memory_chain::MemoryChain;
pub use store::{BatchOp, MemoryStore, PersistentStore, WriteBatch};
pub use types::{BlockHash, BlockInfo, BlockKey, IndexSummary};
