//! Crate-wide error type and result alias.

use thiserror::Error;

use crate::stage::StageKind;

/// Errors surfaced by the orchestration core.
#[derive(Error, Debug)]
pub enum ConveyorError {
    /// Filesystem or pipe failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Event or lock-file payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stage command could not be spawned at all.
    #[error("failed to spawn {stage} command: {source}")]
    Spawn {
        /// Stage whose command failed to launch.
        stage: StageKind,
        /// Underlying spawn error.
        source: std::io::Error,
    },

    /// An external collaborator (input probe, command plan) failed.
    #[error("collaborator error for {stage}: {message}")]
    Collaborator {
        /// Stage the collaborator was queried for.
        stage: StageKind,
        /// Human-readable failure description.
        message: String,
    },

    /// Operation raced with shutdown or was cancelled.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Invariant violation or unexpected internal state.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ConveyorError>;
