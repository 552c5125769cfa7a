//! Error types for the launchpad-remote crate.

use thiserror::Error;

/// Failures of the command execution service itself, as opposed to a
/// command that ran and exited non-zero (that is an [`crate::ExecResult`]).
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Child-process spawn failed.
    #[error("spawn error: {0}")]
    Spawn(String),

    /// Underlying I/O failure (stdin file, pipes).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Command exceeded its time budget and was killed.
    #[error("command timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The runner was closed while the command was queued.
    #[error("command runner closed")]
    Closed,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, RemoteError>;
