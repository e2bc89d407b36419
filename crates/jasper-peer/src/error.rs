//! Error types for the peer loops.

use jasper_kernel::KernelError;
use jasper_types::{CodecError, PeerId};
use thiserror::Error;

/// Errors raised by a [`crate::Log`] implementation.
#[derive(Error, Debug)]
pub enum LogError {
    /// The log no longer accepts operations.
    #[error("log is closed")]
    Closed,

    /// An entry could not be encoded for appending.
    #[error("failed to encode entry: {0}")]
    Encode(#[from] CodecError),

    /// A lock guarding the log state was poisoned by a panicking holder.
    #[error("log state poisoned")]
    Poisoned,
}

/// Peer loop errors.
#[derive(Error, Debug)]
pub enum PeerError {
    /// An entry could not be decoded or applied.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    /// The log failed.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// The outbox loop is gone, so reactions can no longer be persisted.
    #[error("outbox is closed")]
    OutboxClosed,

    /// The processing loop is gone, so control commands cannot be delivered.
    #[error("peer is stopped")]
    Stopped,

    /// A task could not be started.
    #[error("task runner failed for peer {peer}: {reason}")]
    TaskRunner { peer: PeerId, reason: String },

    /// A loop task panicked or was cancelled.
    #[error("peer task failed: {0}")]
    Join(String),
}

impl From<CodecError> for PeerError {
    fn from(err: CodecError) -> Self {
        PeerError::Kernel(KernelError::Codec(err))
    }
}

/// Result type for peer operations.
pub type Result<T> = std::result::Result<T, PeerError>;
