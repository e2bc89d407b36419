//! Reactions: new entries an actor writes back to the log after observing
//! one.
//!
//! Join traffic and readiness signals are immediate so a stalled actor can
//! still finish joining. Everything else is deferred until the actor is
//! unstalled.

use jasper_types::{ActorId, Entry, Reaction};

use crate::diff::{Change, Diff};
use crate::state::Replica;

/// Computes the entries `local` should append in response to `entry`.
///
/// Pure: the same inputs always produce the same reactions, and an actor the
/// diff does not concern never reacts.
pub fn reactions(
    _entry: &Entry,
    _old: &Replica,
    _new: &Replica,
    diff: &Diff,
    local: &ActorId,
) -> Vec<Reaction> {
    match &diff.change {
        Change::InstantJoin { group } if local.is_group(group) => {
            vec![Reaction::immediate(Entry::SignalReady {
                id: local.clone(),
            })]
        }
        Change::JoinPrepared { joiner, watcher } if local.is_group(watcher) => {
            vec![Reaction::immediate(Entry::NotifyJoinCluster {
                joiner: joiner.clone(),
                watcher: watcher.clone(),
            })]
        }
        Change::JoinAborted { joiner } if local.is_group(joiner) => {
            vec![Reaction::immediate(Entry::AbortJoinCluster {
                joiner: joiner.clone(),
            })]
        }
        Change::JoinNotified { joiner, watcher } if local.is_group(joiner) => {
            vec![Reaction::immediate(Entry::AcceptJoinCluster {
                joiner: joiner.clone(),
                watcher: watcher.clone(),
            })]
        }
        Change::JoinAccepted { joiner, .. } if local.is_group(joiner) => {
            vec![Reaction::immediate(Entry::SignalReady {
                id: local.clone(),
            })]
        }
        Change::JoinWithdrawn { joiner } if local.is_group(joiner) => {
            vec![Reaction::immediate(Entry::PrepareJoinCluster {
                joiner: joiner.clone(),
            })]
        }
        Change::PeerAdded { peer, .. } if local.is_peer(peer) => {
            vec![Reaction::immediate(Entry::SignalReady {
                id: local.clone(),
            })]
        }
        Change::GroupRemoved { orphaned, .. } => orphaned
            .iter()
            .filter(|joiner| local.is_group(joiner))
            .map(|joiner| {
                Reaction::immediate(Entry::PrepareJoinCluster {
                    joiner: joiner.clone(),
                })
            })
            .collect(),
        Change::OutputSealed { job, task, peer } if local.is_peer(peer) => {
            vec![Reaction::deferred(Entry::CompleteTask {
                job: job.clone(),
                task: task.clone(),
            })]
        }
        _ => Vec::new(),
    }
}

/// Returns true if every peer and group must observe the entry, not just the
/// actors it addresses.
pub fn is_multiplexed(entry: &Entry) -> bool {
    matches!(entry, Entry::SubmitJob { .. } | Entry::KillJob { .. })
}
