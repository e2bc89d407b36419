//! The replica: every peer's view of global cluster state.
//!
//! A replica is only ever produced by [`crate::kernel::apply`]. Transitions
//! take ownership of `self` and return the updated replica (builder pattern),
//! so the kernel can derive a new snapshot from a clone of the old one while
//! the old one stays available for diffing.

use std::collections::{BTreeMap, BTreeSet};

use jasper_types::{
    ActorId, ClusterChunk, GroupId, JobId, JobScheduler, JobSpec, MessageId, MessagingConfig,
    PeerId, PeerSite, TaskId,
};
use serde::{Deserialize, Serialize};

use crate::allocation::{Allocations, Slot};

// ============================================================================
// Replica
// ============================================================================

/// Global cluster state derived by replaying the log from the start.
///
/// Every collection is ordered, so two replicas built from the same log
/// prefix compare equal and hash identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Replica {
    // Membership
    groups: BTreeSet<GroupId>,
    peers: BTreeSet<PeerId>,
    groups_index: BTreeMap<GroupId, BTreeSet<PeerId>>,
    groups_reverse_index: BTreeMap<PeerId, GroupId>,
    peer_sites: BTreeMap<PeerId, PeerSite>,
    ready_peers: BTreeSet<PeerId>,
    ready_groups: BTreeSet<GroupId>,

    // Join protocol: watcher -> joiner
    prepared: BTreeMap<GroupId, GroupId>,
    accepted: BTreeMap<GroupId, GroupId>,
    aborted: BTreeSet<GroupId>,

    // Jobs
    jobs: Vec<JobId>,
    job_specs: BTreeMap<JobId, JobSpec>,
    allocations: Allocations,
    completed_tasks: BTreeMap<JobId, BTreeSet<TaskId>>,
    sealed_outputs: BTreeMap<JobId, BTreeSet<TaskId>>,
    completed_jobs: BTreeSet<JobId>,
    killed_jobs: BTreeSet<JobId>,

    // Cluster-wide settings
    job_scheduler: JobScheduler,
    messaging: MessagingConfig,

    last_applied: Option<MessageId>,
}

impl Replica {
    /// Creates an empty replica with default cluster settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the origin replica from the cluster-wide chunks stored
    /// alongside the log. Later chunks for the same key are ignored.
    pub fn origin(chunks: impl IntoIterator<Item = ClusterChunk>) -> Self {
        let mut replica = Self::new();
        let mut seen = BTreeSet::new();
        for chunk in chunks {
            if !seen.insert(chunk.key()) {
                continue;
            }
            match chunk {
                ClusterChunk::JobScheduler(scheduler) => replica.job_scheduler = scheduler,
                ClusterChunk::Messaging(messaging) => replica.messaging = messaging,
            }
        }
        replica
    }

    // ------------------------------------------------------------------------
    // Membership queries
    // ------------------------------------------------------------------------

    pub fn groups(&self) -> &BTreeSet<GroupId> {
        &self.groups
    }

    pub fn peers(&self) -> &BTreeSet<PeerId> {
        &self.peers
    }

    pub fn has_group(&self, group: &GroupId) -> bool {
        self.groups.contains(group)
    }

    pub fn has_peer(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    /// Returns the group hosting a peer.
    pub fn group_of(&self, peer: &PeerId) -> Option<&GroupId> {
        self.groups_reverse_index.get(peer)
    }

    /// Returns the peers hosted by a group, in sorted order.
    pub fn peers_of(&self, group: &GroupId) -> impl Iterator<Item = &PeerId> {
        self.groups_index.get(group).into_iter().flatten()
    }

    pub fn peer_site(&self, peer: &PeerId) -> Option<&PeerSite> {
        self.peer_sites.get(peer)
    }

    pub fn is_ready(&self, actor: &ActorId) -> bool {
        match actor {
            ActorId::Peer(id) => self.ready_peers.contains(id),
            ActorId::Group(id) => self.ready_groups.contains(id),
        }
    }

    /// Returns true if the actor is a recognized member of the cluster.
    ///
    /// Peers and groups are checked independently: a group counts while it is
    /// still engaged in a join, a peer only once it has been added.
    pub fn is_member(&self, actor: &ActorId) -> bool {
        match actor {
            ActorId::Peer(id) => self.peers.contains(id),
            ActorId::Group(id) => self.groups.contains(id) || self.is_joining(id),
        }
    }

    /// Every joined peer and group, peers first.
    pub fn members(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.peers
            .iter()
            .cloned()
            .map(ActorId::Peer)
            .chain(self.groups.iter().cloned().map(ActorId::Group))
    }

    // ------------------------------------------------------------------------
    // Join protocol queries
    // ------------------------------------------------------------------------

    pub fn prepared(&self) -> &BTreeMap<GroupId, GroupId> {
        &self.prepared
    }

    pub fn accepted(&self) -> &BTreeMap<GroupId, GroupId> {
        &self.accepted
    }

    pub fn aborted(&self) -> &BTreeSet<GroupId> {
        &self.aborted
    }

    /// Returns true if the group is part way through joining.
    pub fn is_joining(&self, group: &GroupId) -> bool {
        self.aborted.contains(group)
            || self.prepared.values().any(|joiner| joiner == group)
            || self.accepted.values().any(|joiner| joiner == group)
    }

    /// Returns true if the group takes part in a join on either side.
    pub(crate) fn is_engaged(&self, group: &GroupId) -> bool {
        self.prepared.contains_key(group)
            || self.accepted.contains_key(group)
            || self.is_joining(group)
    }

    /// Joined groups that may watch a new joiner, in sorted order.
    pub(crate) fn watcher_candidates(&self) -> Vec<&GroupId> {
        self.groups
            .iter()
            .filter(|group| !self.is_engaged(group))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Job queries
    // ------------------------------------------------------------------------

    /// Submitted jobs in log order, including finished ones not yet collected.
    pub fn jobs(&self) -> &[JobId] {
        &self.jobs
    }

    pub fn job_spec(&self, job: &JobId) -> Option<&JobSpec> {
        self.job_specs.get(job)
    }

    /// Returns true if the job has been submitted and has not finished.
    pub fn is_active(&self, job: &JobId) -> bool {
        self.job_specs.contains_key(job)
            && !self.completed_jobs.contains(job)
            && !self.killed_jobs.contains(job)
    }

    /// Jobs eligible for allocation, in log order.
    pub fn active_jobs(&self) -> impl Iterator<Item = &JobId> {
        self.jobs.iter().filter(|job| self.is_active(job))
    }

    /// Returns true if the job id has ever been seen, even if collected.
    pub(crate) fn knows_job(&self, job: &JobId) -> bool {
        self.job_specs.contains_key(job)
            || self.completed_jobs.contains(job)
            || self.killed_jobs.contains(job)
    }

    /// Tasks of a job that have not completed, in declaration order.
    pub fn incomplete_tasks(&self, job: &JobId) -> Vec<&TaskId> {
        let completed = self.completed_tasks.get(job);
        self.job_specs
            .get(job)
            .map(|spec| {
                spec.tasks
                    .iter()
                    .filter(|task| completed.is_none_or(|done| !done.contains(*task)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_task(&self, job: &JobId, task: &TaskId) -> bool {
        self.job_specs
            .get(job)
            .is_some_and(|spec| spec.tasks.contains(task))
    }

    pub fn is_task_complete(&self, job: &JobId, task: &TaskId) -> bool {
        self.completed_tasks
            .get(job)
            .is_some_and(|tasks| tasks.contains(task))
    }

    pub fn is_output_sealed(&self, job: &JobId, task: &TaskId) -> bool {
        self.sealed_outputs
            .get(job)
            .is_some_and(|tasks| tasks.contains(task))
    }

    pub fn completed_jobs(&self) -> &BTreeSet<JobId> {
        &self.completed_jobs
    }

    pub fn killed_jobs(&self) -> &BTreeSet<JobId> {
        &self.killed_jobs
    }

    pub fn allocations(&self) -> &Allocations {
        &self.allocations
    }

    /// Returns the job and task a peer is allocated to.
    pub fn slot_of(&self, peer: &PeerId) -> Option<Slot> {
        self.allocations.iter().find_map(|(job, tasks)| {
            tasks
                .iter()
                .find(|(_, peers)| peers.contains(peer))
                .map(|(task, _)| Slot::new(job.clone(), task.clone()))
        })
    }

    /// Peers that may be allocated: joined and ready, in sorted order.
    pub fn schedulable_peers(&self) -> Vec<&PeerId> {
        self.peers
            .iter()
            .filter(|peer| self.ready_peers.contains(*peer))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    pub fn job_scheduler(&self) -> JobScheduler {
        self.job_scheduler
    }

    pub fn messaging(&self) -> &MessagingConfig {
        &self.messaging
    }

    /// Message ID of the last applied entry: the replica's version.
    pub fn last_applied(&self) -> Option<MessageId> {
        self.last_applied
    }

    // ------------------------------------------------------------------------
    // Transitions (internal to the kernel)
    // ------------------------------------------------------------------------

    pub(crate) fn with_last_applied(mut self, id: MessageId) -> Self {
        self.last_applied = Some(id);
        self
    }

    /// Adds a group to the cluster and clears any join record for it.
    pub(crate) fn with_group_joined(mut self, group: GroupId) -> Self {
        self.prepared.retain(|_, joiner| *joiner != group);
        self.accepted.retain(|_, joiner| *joiner != group);
        self.aborted.remove(&group);
        self.groups_index.entry(group.clone()).or_default();
        self.groups.insert(group);
        self
    }

    pub(crate) fn with_prepared(mut self, watcher: GroupId, joiner: GroupId) -> Self {
        self.prepared.insert(watcher, joiner);
        self
    }

    /// Moves a join from prepared to accepted.
    pub(crate) fn with_accepted(mut self, watcher: GroupId, joiner: GroupId) -> Self {
        self.prepared.remove(&watcher);
        self.accepted.insert(watcher, joiner);
        self
    }

    pub(crate) fn with_aborted(mut self, joiner: GroupId) -> Self {
        self.aborted.insert(joiner);
        self
    }

    pub(crate) fn without_aborted(mut self, joiner: &GroupId) -> Self {
        self.aborted.remove(joiner);
        self
    }

    pub(crate) fn with_peer(mut self, peer: PeerId, group: GroupId, site: PeerSite) -> Self {
        self.groups_index
            .entry(group.clone())
            .or_default()
            .insert(peer.clone());
        self.groups_reverse_index.insert(peer.clone(), group);
        self.peer_sites.insert(peer.clone(), site);
        self.peers.insert(peer);
        self
    }

    pub(crate) fn without_peer(mut self, peer: &PeerId) -> Self {
        if let Some(group) = self.groups_reverse_index.remove(peer) {
            if let Some(peers) = self.groups_index.get_mut(&group) {
                peers.remove(peer);
            }
        }
        self.peer_sites.remove(peer);
        self.ready_peers.remove(peer);
        self.peers.remove(peer);
        self
    }

    /// Removes a group, every peer it hosts and every join it takes part in.
    pub(crate) fn without_group(mut self, group: &GroupId) -> Self {
        let hosted: Vec<PeerId> = self.peers_of(group).cloned().collect();
        for peer in &hosted {
            self = self.without_peer(peer);
        }
        self.groups_index.remove(group);
        self.prepared
            .retain(|watcher, joiner| watcher != group && joiner != group);
        self.accepted
            .retain(|watcher, joiner| watcher != group && joiner != group);
        self.aborted.remove(group);
        self.ready_groups.remove(group);
        self.groups.remove(group);
        self
    }

    pub(crate) fn with_ready(mut self, actor: ActorId) -> Self {
        match actor {
            ActorId::Peer(id) => {
                self.ready_peers.insert(id);
            }
            ActorId::Group(id) => {
                self.ready_groups.insert(id);
            }
        }
        self
    }

    pub(crate) fn with_job(mut self, job: JobId, spec: JobSpec) -> Self {
        self.jobs.push(job.clone());
        self.job_specs.insert(job, spec);
        self
    }

    pub(crate) fn with_killed_job(mut self, job: JobId) -> Self {
        self.killed_jobs.insert(job);
        self
    }

    pub(crate) fn with_sealed_output(mut self, job: JobId, task: TaskId) -> Self {
        self.sealed_outputs.entry(job).or_default().insert(task);
        self
    }

    /// Marks a task complete and completes the job once no task remains.
    pub(crate) fn with_completed_task(mut self, job: JobId, task: TaskId) -> Self {
        self.completed_tasks
            .entry(job.clone())
            .or_default()
            .insert(task);
        if self.incomplete_tasks(&job).is_empty() {
            self.completed_jobs.insert(job);
        }
        self
    }

    /// Drops all bookkeeping for finished jobs. Their ids stay in the
    /// terminal sets so a resubmission is still recognized.
    pub(crate) fn collect_garbage(mut self) -> Self {
        let finished: BTreeSet<JobId> = self
            .completed_jobs
            .union(&self.killed_jobs)
            .cloned()
            .collect();
        self.jobs.retain(|job| !finished.contains(job));
        for job in &finished {
            self.job_specs.remove(job);
            self.allocations.remove(job);
            self.completed_tasks.remove(job);
            self.sealed_outputs.remove(job);
        }
        self
    }

    pub(crate) fn with_allocations(mut self, allocations: Allocations) -> Self {
        self.allocations = allocations;
        self
    }

    /// Recomputes allocations from scratch.
    pub(crate) fn reallocated(self) -> Self {
        let allocations = crate::allocation::allocate(&self);
        self.with_allocations(allocations)
    }

    // Read access for hashing.
    pub(crate) fn sealed_outputs(&self) -> &BTreeMap<JobId, BTreeSet<TaskId>> {
        &self.sealed_outputs
    }

    pub(crate) fn completed_tasks(&self) -> &BTreeMap<JobId, BTreeSet<TaskId>> {
        &self.completed_tasks
    }

    pub(crate) fn ready_peers(&self) -> &BTreeSet<PeerId> {
        &self.ready_peers
    }

    pub(crate) fn ready_groups(&self) -> &BTreeSet<GroupId> {
        &self.ready_groups
    }

    pub(crate) fn groups_index(&self) -> &BTreeMap<GroupId, BTreeSet<PeerId>> {
        &self.groups_index
    }

    pub(crate) fn peer_sites(&self) -> &BTreeMap<PeerId, PeerSite> {
        &self.peer_sites
    }
}
