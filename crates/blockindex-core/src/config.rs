//! Engine configuration and lifecycle state types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Configuration for an index engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// While catching up, how often the checkpoint (and the readable best
    /// block) advances, in milliseconds.
    pub locator_write_interval_ms: u64,
    /// While catching up, how often progress is logged, in milliseconds.
    pub sync_log_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            locator_write_interval_ms: 30_000,
            sync_log_interval_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, IndexerError> {
        serde_json::from_str(json).map_err(|e| IndexerError::Config(e.to_string()))
    }

    pub fn locator_write_interval(&self) -> Duration {
        Duration::from_millis(self.locator_write_interval_ms)
    }

    pub fn sync_log_interval(&self) -> Duration {
        Duration::from_millis(self.sync_log_interval_ms)
    }
}

/// Lifecycle state of an index engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Constructed, `init` not called yet.
    Uninitialized,
    /// `init` is reading the checkpoint and attaching to the chain.
    Initializing,
    /// Subscribed: catching up or following the tip.
    Running,
    /// Unsubscribed; no further mutation.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
