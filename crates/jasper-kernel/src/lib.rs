//! # jasper-kernel: Replica state machine for `Jasper`
//!
//! The kernel is the pure, deterministic heart of the cluster-control log.
//! Every peer feeds the same ordered entries through it and so derives the
//! same replica.
//!
//! ## Key Principles
//!
//! - **No IO**: the kernel never touches the log, the network or tasks
//! - **No randomness**: watcher choice and allocation are pure functions of
//!   the replica
//! - **Pure functions**: `apply(entry, replica) -> replica'`, with diff,
//!   reactions and side effects derived from `(entry, old, new)`
//!
//! ## Architecture
//!
//! - [`state`]: the [`Replica`]
//! - [`kernel`]: [`apply`] and the per-entry [`step`] pipeline
//! - [`diff`]: structural deltas between consecutive replicas
//! - [`reactions`]: entries an actor writes back in response
//! - [`effects`]: local [`SideEffect`]s planned for the peer to execute
//! - [`allocation`]: deterministic peer-to-task allocation
//! - [`stall`]: the output policy for reactions while an actor is stalled
//!
//! ## Example
//!
//! ```
//! use jasper_kernel::{Replica, step};
//! use jasper_types::{ActorId, Entry, GroupId, LogEntry, MessageId};
//!
//! let g1 = GroupId::new("g1");
//! let entry = LogEntry::at(MessageId::ZERO, Entry::PrepareJoinCluster { joiner: g1.clone() });
//!
//! let (transition, consequences) = step(&entry, &Replica::new(), &ActorId::Group(g1.clone()))?;
//! assert!(transition.replica.has_group(&g1));
//! assert_eq!(consequences.reactions.len(), 1);
//! # Ok::<(), jasper_kernel::KernelError>(())
//! ```

pub mod allocation;
pub mod diff;
pub mod effects;
pub mod kernel;
pub mod reactions;
pub mod stall;
pub mod state;
pub mod state_hash;


pub use allocation::{Allocations, Slot, TaskAllocations};
pub use diff::{AllocationMove, Change, Diff};
pub use effects::SideEffect;
pub use kernel::{Consequences, KernelError, Transition, apply, consequences, step, transition};
pub use reactions::{is_multiplexed, reactions};
pub use stall::StallBuffer;
pub use state::Replica;
