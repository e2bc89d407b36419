//! Structural deltas between two consecutive replicas.
//!
//! A [`Diff`] is computed from `(entry, old, new)` and never persisted. It is
//! the input reactions and side effects are planned from, so it names every
//! actor an entry touched.

use std::collections::BTreeMap;

use jasper_types::{ActorId, Entry, GroupId, JobId, PeerId, TaskId};
use serde::{Deserialize, Serialize};

use crate::allocation::Slot;
use crate::state::Replica;

/// The membership or job-level change an entry caused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "change", rename_all = "kebab-case")]
pub enum Change {
    /// The entry did not apply.
    #[default]
    None,
    /// The first group of an empty cluster joined without a watcher.
    InstantJoin { group: GroupId },
    JoinPrepared { joiner: GroupId, watcher: GroupId },
    /// No watcher was free; the joiner must abort and try again.
    JoinAborted { joiner: GroupId },
    JoinNotified { joiner: GroupId, watcher: GroupId },
    JoinAccepted { joiner: GroupId, watcher: GroupId },
    /// An aborted join record was cleared.
    JoinWithdrawn { joiner: GroupId },
    PeerAdded { peer: PeerId, group: GroupId },
    PeerRemoved { peer: PeerId },
    /// A group left, taking its peers with it. `orphaned` lists joiners
    /// whose watcher was the removed group.
    GroupRemoved {
        group: GroupId,
        peers: Vec<PeerId>,
        orphaned: Vec<GroupId>,
    },
    Ready { actor: ActorId },
    JobSubmitted { job: JobId },
    JobKilled { job: JobId },
    OutputSealed { job: JobId, task: TaskId, peer: PeerId },
    TaskCompleted { job: JobId, task: TaskId, job_completed: bool },
    Collected { jobs: Vec<JobId> },
}

/// One peer's allocation before and after an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationMove {
    pub peer: PeerId,
    pub from: Option<Slot>,
    pub to: Option<Slot>,
}

/// Structural delta produced by one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Diff {
    pub change: Change,
    /// Allocation changes, sorted by peer.
    pub moves: Vec<AllocationMove>,
}

impl Diff {
    /// Returns true if the entry changed nothing.
    pub fn is_empty(&self) -> bool {
        self.change == Change::None && self.moves.is_empty()
    }

    /// Every actor this diff names, sorted and deduplicated.
    pub fn involved(&self) -> Vec<ActorId> {
        let mut actors: Vec<ActorId> = match &self.change {
            Change::None
            | Change::JobSubmitted { .. }
            | Change::JobKilled { .. }
            | Change::TaskCompleted { .. }
            | Change::Collected { .. } => Vec::new(),
            Change::InstantJoin { group } => vec![group.clone().into()],
            Change::JoinPrepared { joiner, watcher }
            | Change::JoinNotified { joiner, watcher }
            | Change::JoinAccepted { joiner, watcher } => {
                vec![joiner.clone().into(), watcher.clone().into()]
            }
            Change::JoinAborted { joiner } | Change::JoinWithdrawn { joiner } => {
                vec![joiner.clone().into()]
            }
            Change::PeerAdded { peer, group } => vec![peer.clone().into(), group.clone().into()],
            Change::PeerRemoved { peer } => vec![peer.clone().into()],
            Change::GroupRemoved {
                group,
                peers,
                orphaned,
            } => std::iter::once(ActorId::from(group.clone()))
                .chain(peers.iter().cloned().map(ActorId::Peer))
                .chain(orphaned.iter().cloned().map(ActorId::Group))
                .collect(),
            Change::Ready { actor } => vec![actor.clone()],
            Change::OutputSealed { peer, .. } => vec![peer.clone().into()],
        };
        actors.extend(self.moves.iter().map(|m| ActorId::Peer(m.peer.clone())));
        actors.sort();
        actors.dedup();
        actors
    }

    /// Returns the allocation move for a peer, if it moved.
    pub fn move_of(&self, peer: &PeerId) -> Option<&AllocationMove> {
        self.moves.iter().find(|m| &m.peer == peer)
    }
}

/// Computes the delta an entry caused between `old` and `new`.
pub fn diff(entry: &Entry, old: &Replica, new: &Replica) -> Diff {
    Diff {
        change: change(entry, old, new),
        moves: allocation_moves(old, new),
    }
}

fn change(entry: &Entry, old: &Replica, new: &Replica) -> Change {
    match entry {
        Entry::PrepareJoinCluster { joiner } => {
            if new.has_group(joiner) && !old.has_group(joiner) {
                Change::InstantJoin {
                    group: joiner.clone(),
                }
            } else if let Some((watcher, _)) = new
                .prepared()
                .iter()
                .find(|(watcher, j)| *j == joiner && old.prepared().get(*watcher) != Some(*j))
            {
                Change::JoinPrepared {
                    joiner: joiner.clone(),
                    watcher: watcher.clone(),
                }
            } else if new.aborted().contains(joiner) && !old.aborted().contains(joiner) {
                Change::JoinAborted {
                    joiner: joiner.clone(),
                }
            } else {
                Change::None
            }
        }
        Entry::NotifyJoinCluster { joiner, watcher } => {
            if new.accepted().get(watcher) == Some(joiner)
                && old.accepted().get(watcher) != Some(joiner)
            {
                Change::JoinNotified {
                    joiner: joiner.clone(),
                    watcher: watcher.clone(),
                }
            } else {
                Change::None
            }
        }
        Entry::AcceptJoinCluster { joiner, watcher } => {
            if new.has_group(joiner) && !old.has_group(joiner) {
                Change::JoinAccepted {
                    joiner: joiner.clone(),
                    watcher: watcher.clone(),
                }
            } else {
                Change::None
            }
        }
        Entry::AbortJoinCluster { joiner } => {
            if old.aborted().contains(joiner) && !new.aborted().contains(joiner) {
                Change::JoinWithdrawn {
                    joiner: joiner.clone(),
                }
            } else {
                Change::None
            }
        }
        Entry::AddVirtualPeer { id, group, .. } => {
            if new.has_peer(id) && !old.has_peer(id) {
                Change::PeerAdded {
                    peer: id.clone(),
                    group: group.clone(),
                }
            } else {
                Change::None
            }
        }
        Entry::LeaveCluster { id } => {
            if old.has_peer(id) && !new.has_peer(id) {
                Change::PeerRemoved { peer: id.clone() }
            } else {
                Change::None
            }
        }
        Entry::GroupLeaveCluster { id } => {
            if old.is_member(&id.clone().into()) && !new.is_member(&id.clone().into()) {
                let orphaned = old
                    .prepared()
                    .get(id)
                    .into_iter()
                    .chain(old.accepted().get(id))
                    .filter(|joiner| *joiner != id)
                    .cloned()
                    .collect();
                Change::GroupRemoved {
                    group: id.clone(),
                    peers: old.peers_of(id).cloned().collect(),
                    orphaned,
                }
            } else {
                Change::None
            }
        }
        Entry::SignalReady { id } => {
            if new.is_ready(id) && !old.is_ready(id) {
                Change::Ready { actor: id.clone() }
            } else {
                Change::None
            }
        }
        Entry::SubmitJob { job, .. } => {
            if new.job_spec(job).is_some() && old.job_spec(job).is_none() {
                Change::JobSubmitted { job: job.clone() }
            } else {
                Change::None
            }
        }
        Entry::KillJob { job } => {
            if new.killed_jobs().contains(job) && !old.killed_jobs().contains(job) {
                Change::JobKilled { job: job.clone() }
            } else {
                Change::None
            }
        }
        Entry::SealOutput { job, task, peer } => {
            if new.is_output_sealed(job, task) && !old.is_output_sealed(job, task) {
                Change::OutputSealed {
                    job: job.clone(),
                    task: task.clone(),
                    peer: peer.clone(),
                }
            } else {
                Change::None
            }
        }
        Entry::CompleteTask { job, task } => {
            if new.is_task_complete(job, task) && !old.is_task_complete(job, task) {
                Change::TaskCompleted {
                    job: job.clone(),
                    task: task.clone(),
                    job_completed: new.completed_jobs().contains(job)
                        && !old.completed_jobs().contains(job),
                }
            } else {
                Change::None
            }
        }
        Entry::Gc => {
            let jobs: Vec<JobId> = old
                .jobs()
                .iter()
                .filter(|job| !new.jobs().contains(job))
                .cloned()
                .collect();
            if jobs.is_empty() {
                Change::None
            } else {
                Change::Collected { jobs }
            }
        }
    }
}

fn slots(replica: &Replica) -> BTreeMap<&PeerId, Slot> {
    replica
        .allocations()
        .iter()
        .flat_map(|(job, tasks)| {
            tasks.iter().flat_map(move |(task, peers)| {
                peers
                    .iter()
                    .map(move |peer| (peer, Slot::new(job.clone(), task.clone())))
            })
        })
        .collect()
}

fn allocation_moves(old: &Replica, new: &Replica) -> Vec<AllocationMove> {
    let mut before = slots(old);
    let mut after = slots(new);
    let mut peers: Vec<PeerId> = before.keys().chain(after.keys()).map(|p| (*p).clone()).collect();
    peers.sort();
    peers.dedup();

    peers
        .into_iter()
        .filter_map(|peer| {
            let from = before.remove(&peer);
            let to = after.remove(&peer);
            (from != to).then_some(AllocationMove { peer, from, to })
        })
        .collect()
}
