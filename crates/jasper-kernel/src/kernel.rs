//! The replica state machine.
//!
//! [`apply`] is the single transition function: `(entry, replica) ->
//! replica'`. It is total over well-formed entries. An entry that does not
//! apply leaves the replica unchanged apart from its version.
//!
//! [`step`] runs the full per-entry pipeline for one actor: ordering check,
//! apply, diff, reactions and side effects. The peer processing loop and the
//! replay model both go through it.

use jasper_types::{ActorId, CodecError, Entry, GroupId, LogEntry, MessageId, Reaction};

use crate::diff::{Diff, diff};
use crate::effects::{SideEffect, side_effects};
use crate::reactions::reactions;
use crate::state::Replica;

// ============================================================================
// Apply
// ============================================================================

/// Applies an entry to a replica, returning the next replica.
pub fn apply(entry: &LogEntry, replica: &Replica) -> Replica {
    let next = apply_entry(&entry.entry, replica.clone());
    match entry.message_id {
        Some(id) => next.with_last_applied(id),
        None => next,
    }
}

fn apply_entry(entry: &Entry, replica: Replica) -> Replica {
    match entry {
        // ====================================================================
        // Join protocol
        // ====================================================================
        Entry::PrepareJoinCluster { joiner } => {
            if replica.has_group(joiner) || replica.is_joining(joiner) {
                return replica;
            }
            if replica.groups().is_empty() {
                return replica.with_group_joined(joiner.clone());
            }
            match choose_watcher(&replica, joiner) {
                Some(watcher) => replica.with_prepared(watcher, joiner.clone()),
                None => replica.with_aborted(joiner.clone()),
            }
        }

        Entry::NotifyJoinCluster { joiner, watcher } => {
            if replica.prepared().get(watcher) == Some(joiner) {
                replica.with_accepted(watcher.clone(), joiner.clone())
            } else {
                replica
            }
        }

        Entry::AcceptJoinCluster { joiner, watcher } => {
            if replica.accepted().get(watcher) == Some(joiner) {
                replica.with_group_joined(joiner.clone())
            } else {
                replica
            }
        }

        Entry::AbortJoinCluster { joiner } => {
            if replica.aborted().contains(joiner) {
                replica.without_aborted(joiner)
            } else {
                replica
            }
        }

        // ====================================================================
        // Membership
        // ====================================================================
        Entry::AddVirtualPeer { id, group, site } => {
            if !replica.has_group(group) || replica.has_peer(id) {
                return replica;
            }
            replica.with_peer(id.clone(), group.clone(), site.clone())
        }

        Entry::LeaveCluster { id } => {
            if !replica.has_peer(id) {
                return replica;
            }
            replica.without_peer(id).reallocated()
        }

        Entry::GroupLeaveCluster { id } => {
            if !replica.is_member(&ActorId::Group(id.clone())) {
                return replica;
            }
            replica.without_group(id).reallocated()
        }

        Entry::SignalReady { id } => {
            if !replica.is_member(id) || replica.is_ready(id) {
                return replica;
            }
            // Only joined groups become ready, not ones still joining.
            if let ActorId::Group(group) = id {
                if !replica.has_group(group) {
                    return replica;
                }
            }
            replica.with_ready(id.clone()).reallocated()
        }

        // ====================================================================
        // Jobs
        // ====================================================================
        Entry::SubmitJob { job, spec } => {
            if replica.knows_job(job) || spec.tasks.is_empty() {
                return replica;
            }
            replica.with_job(job.clone(), spec.clone()).reallocated()
        }

        Entry::KillJob { job } => {
            if !replica.is_active(job) {
                return replica;
            }
            replica.with_killed_job(job.clone()).reallocated()
        }

        Entry::SealOutput { job, task, .. } => {
            if !replica.is_active(job)
                || !replica.has_task(job, task)
                || replica.is_output_sealed(job, task)
            {
                return replica;
            }
            replica.with_sealed_output(job.clone(), task.clone())
        }

        Entry::CompleteTask { job, task } => {
            if !replica.is_active(job)
                || !replica.has_task(job, task)
                || replica.is_task_complete(job, task)
            {
                return replica;
            }
            replica
                .with_completed_task(job.clone(), task.clone())
                .reallocated()
        }

        Entry::Gc => replica.collect_garbage(),
    }
}

/// Picks the watcher for a joiner among groups not engaged in any join.
///
/// Deterministic: candidates are sorted and indexed by a hash of the joiner,
/// so every replica picks the same watcher for the same prefix.
fn choose_watcher(replica: &Replica, joiner: &GroupId) -> Option<GroupId> {
    let candidates = replica.watcher_candidates();
    if candidates.is_empty() {
        return None;
    }
    let hash = blake3::hash(joiner.as_str().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    let index = u64::from_le_bytes(prefix) % candidates.len() as u64;
    usize::try_from(index)
        .ok()
        .and_then(|i| candidates.get(i))
        .map(|watcher| (*watcher).clone())
}

// ============================================================================
// Step
// ============================================================================

/// The outcome of applying one positioned entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub replica: Replica,
    pub diff: Diff,
}

/// What one actor must do after an entry was applied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Consequences {
    pub reactions: Vec<Reaction>,
    pub effects: Vec<SideEffect>,
}

/// Applies an entry after checking it is ordered after the replica's version.
pub fn transition(entry: &LogEntry, replica: &Replica) -> Result<Transition, KernelError> {
    if let (Some(last), Some(got)) = (replica.last_applied(), entry.message_id) {
        if got <= last {
            return Err(KernelError::OutOfOrder { last, got });
        }
    }
    let next = apply(entry, replica);
    let diff = diff(&entry.entry, replica, &next);
    Ok(Transition {
        replica: next,
        diff,
    })
}

/// Computes the reactions and side effects of a transition for one actor.
pub fn consequences(
    entry: &LogEntry,
    old: &Replica,
    transition: &Transition,
    local: &ActorId,
) -> Consequences {
    let entry = &entry.entry;
    let new = &transition.replica;
    Consequences {
        reactions: reactions(entry, old, new, &transition.diff, local),
        effects: side_effects(entry, old, new, &transition.diff, local),
    }
}

/// Runs the whole pipeline for one actor.
pub fn step(
    entry: &LogEntry,
    replica: &Replica,
    local: &ActorId,
) -> Result<(Transition, Consequences), KernelError> {
    let transition = transition(entry, replica)?;
    let consequences = consequences(entry, replica, &transition, local);
    Ok((transition, consequences))
}

/// Errors that can occur while feeding entries to the state machine.
#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    #[error("entry {got} is not ordered after last applied entry {last}")]
    OutOfOrder { last: MessageId, got: MessageId },

    #[error(transparent)]
    Codec(#[from] CodecError),
}
