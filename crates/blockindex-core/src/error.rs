//! Error types for the index synchronization engine.

use thiserror::Error;

/// Errors that can occur while synchronizing an index.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Extension error in '{index}': {reason}")]
    Extension { index: String, reason: String },

    #[error(
        "{index}: best block of the index not found. Please rebuild the index (restart with a wiped index directory)"
    )]
    StaleCheckpoint { index: String },

    #[error(
        "{index}: best block of the index goes beyond pruned data. Please disable the index or reindex (which will download the whole blockchain again)"
    )]
    PruneViolation { index: String },

    #[error("{index} is incompatible with block pruning")]
    PruneNotAllowed { index: String },

    #[error("Index engine is already initialized")]
    AlreadyInitialized,

    #[error("Index engine is not initialized")]
    NotInitialized,

    #[error("Index engine is stopped")]
    Stopped,

    #[error("Fatal error in '{index}': {reason}")]
    Fatal { index: String, reason: String },
}

impl IndexerError {
    /// Shorthand for an extension hook failure.
    pub fn extension(index: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Extension {
            index: index.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if the operator has to rebuild the index to recover.
    pub fn requires_rebuild(&self) -> bool {
        matches!(
            self,
            Self::StaleCheckpoint { .. } | Self::PruneViolation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_errors_name_the_index() {
        let err = IndexerError::StaleCheckpoint {
            index: "txindex".into(),
        };
        assert!(err.requires_rebuild());
        assert!(err.to_string().starts_with("txindex:"));
        assert!(!IndexerError::Storage("disk full".into()).requires_rebuild());
    }
}
