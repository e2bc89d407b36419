//! Side effects planned by the kernel.
//!
//! The kernel never touches a peer's local state. It describes what must
//! happen to it and the peer executes the plan, the same way the runtime
//! executes storage effects for a pure state machine.

use jasper_types::{ActorId, Entry, GroupId, JobId, TaskId};
use serde::{Deserialize, Serialize};

use crate::diff::{Change, Diff};
use crate::state::Replica;

/// A local action an actor takes after applying an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "kebab-case")]
pub enum SideEffect {
    /// This actor's readiness was recorded: flush deferred reactions.
    Unstall,
    /// This group has joined. `watching` is the group it monitors, if any.
    Joined { watching: Option<GroupId> },
    /// Start executing an allocated task.
    StartTask { job: JobId, task: TaskId },
    /// Stop the task currently running.
    StopTask { job: JobId, task: TaskId },
    /// This actor was removed from the cluster and must shut down.
    Evicted,
}

/// Plans the side effects `entry` has on `local`.
///
/// Effects are returned in execution order: readiness and join first, then
/// task changes, eviction last. Empty when `local` is not involved.
pub fn side_effects(
    _entry: &Entry,
    _old: &Replica,
    _new: &Replica,
    diff: &Diff,
    local: &ActorId,
) -> Vec<SideEffect> {
    let mut effects = Vec::new();

    match &diff.change {
        Change::Ready { actor } if actor == local => effects.push(SideEffect::Unstall),
        Change::InstantJoin { group } if local.is_group(group) => {
            effects.push(SideEffect::Joined { watching: None });
        }
        Change::JoinAccepted { joiner, watcher } if local.is_group(joiner) => {
            effects.push(SideEffect::Joined {
                watching: Some(watcher.clone()),
            });
        }
        _ => {}
    }

    if let Some(peer) = local.as_peer() {
        if let Some(moved) = diff.move_of(peer) {
            if let Some(from) = &moved.from {
                effects.push(SideEffect::StopTask {
                    job: from.job.clone(),
                    task: from.task.clone(),
                });
            }
            if let Some(to) = &moved.to {
                effects.push(SideEffect::StartTask {
                    job: to.job.clone(),
                    task: to.task.clone(),
                });
            }
        }
    }

    let evicted = match &diff.change {
        Change::PeerRemoved { peer } => local.is_peer(peer),
        Change::GroupRemoved { group, peers, .. } => {
            local.is_group(group) || local.as_peer().is_some_and(|p| peers.contains(p))
        }
        _ => false,
    };
    if evicted {
        effects.push(SideEffect::Evicted);
    }

    effects
}
