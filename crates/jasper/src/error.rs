//! Error types for the Jasper facade.

use std::time::Duration;

use jasper_peer::{LogError, PeerError};
use jasper_types::{ActorId, MessageId};
use thiserror::Error;

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, JasperError>;

/// Errors that can occur while driving a local cluster.
#[derive(Debug, Error)]
pub enum JasperError {
    /// A peer loop failed or is gone.
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    /// The shared log rejected an operation.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// An actor with this ID is already running.
    #[error("{0} is already running")]
    DuplicateActor(ActorId),

    /// No running actor has this ID.
    #[error("{0} is not running")]
    UnknownActor(ActorId),

    /// An actor holds a different replica than the others after applying
    /// the same log prefix.
    #[error("{actor} diverged after message {at:?}")]
    Diverged {
        actor: ActorId,
        at: Option<MessageId>,
    },

    /// A wait did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
