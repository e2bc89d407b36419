//! # jasper-sim: Replay model for the Jasper protocol
//!
//! A reference model of "N actors race to append to the log", used to check
//! that the join and job protocols converge without real concurrency or IO.
//!
//! ## Architecture
//!
//! - [`population`]: the actors and jobs a run starts from
//! - [`replay`]: the seeded [`ReplayModel`] and its liveness checks
//! - [`explore`]: convergence across seeds and a depth-first walk over
//!   interleavings
//!
//! Every step applies an entry through the same kernel pipeline the peer
//! processing loop uses, and routes reactions through the same
//! [`StallBuffer`](jasper_kernel::StallBuffer). The model therefore checks
//! the real protocol, not a copy of it.
//!
//! ## Failures
//!
//! A run that applies more entries than its ceiling, or that is left with
//! queued entries no actor may write, is a liveness failure. Both carry a
//! [`ReplayDump`] with the replica, the queues, the log and every scheduling
//! decision.

pub mod error;
pub mod explore;
pub mod population;
pub mod replay;

pub use error::{ReplayError, Result};
pub use explore::{Convergence, Exploration, check_convergence, explore};
pub use population::Population;
pub use replay::{
    ActorState, Decision, QueueKey, ReplayDump, ReplayModel, ReplayOptions, ReplayOutcome,
    hash_hex,
};
