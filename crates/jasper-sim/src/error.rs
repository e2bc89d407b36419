//! Replay failures.

use jasper_kernel::KernelError;

use crate::replay::ReplayDump;

/// Errors that end a replay run.
///
/// Liveness failures carry a full dump of the model at the point it gave up,
/// so a failing seed can be diagnosed without rerunning it.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// More entries were applied than the ceiling allows.
    #[error("liveness ceiling of {ceiling} applied entries exceeded")]
    LivenessExceeded {
        ceiling: usize,
        dump: Box<ReplayDump>,
    },

    /// Entries remain queued but no queue can make progress.
    #[error("deadlock: {pending} entries queued, none selectable")]
    Deadlock {
        pending: usize,
        dump: Box<ReplayDump>,
    },

    /// Two seeds over the same population ended in different replicas.
    #[error("seed {seed} ended in state {actual}, expected {expected}")]
    Divergence {
        seed: u64,
        expected: String,
        actual: String,
    },

    /// Two explored interleavings ended in different replicas.
    #[error("interleaving {path} ended in state {actual}, expected {expected}")]
    PathDivergence {
        path: usize,
        expected: String,
        actual: String,
    },

    #[error("no queue with key {0}")]
    UnknownQueue(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl ReplayError {
    /// The state dump, for liveness failures.
    pub fn dump(&self) -> Option<&ReplayDump> {
        match self {
            ReplayError::LivenessExceeded { dump, .. } | ReplayError::Deadlock { dump, .. } => {
                Some(dump)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplayError>;
