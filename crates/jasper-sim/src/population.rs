//! Initial actor populations for the replay model.

use jasper_types::{ActorId, Entry, GroupId, JobId, JobSpec, PeerId, PeerSite};
use serde::{Deserialize, Serialize};

/// The actors of a replay run and the jobs a client submits.
///
/// Every group starts by asking to join, every virtual peer by asking to be
/// added through its group, and the client submits the jobs in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Population {
    pub groups: Vec<GroupId>,
    pub peers: Vec<(PeerId, GroupId)>,
    pub jobs: Vec<(JobId, JobSpec)>,
}

impl Population {
    pub fn new() -> Self {
        Self::default()
    }

    /// `groups` groups named `g1..`, each hosting `peers_per_group` peers
    /// named `g<i>-p<j>`.
    pub fn grid(groups: usize, peers_per_group: usize) -> Self {
        let mut population = Self::new();
        for g in 1..=groups {
            let group = GroupId::new(format!("g{g}"));
            population = population.with_group(group.clone());
            for p in 1..=peers_per_group {
                population = population.with_peer(PeerId::new(format!("g{g}-p{p}")), group.clone());
            }
        }
        population
    }

    pub fn with_group(mut self, group: impl Into<GroupId>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn with_peer(mut self, peer: impl Into<PeerId>, group: impl Into<GroupId>) -> Self {
        self.peers.push((peer.into(), group.into()));
        self
    }

    pub fn with_job(mut self, job: impl Into<JobId>, spec: JobSpec) -> Self {
        self.jobs.push((job.into(), spec));
        self
    }

    /// Adds `count` single-task jobs named `j1..`.
    pub fn with_jobs(mut self, count: usize) -> Self {
        for j in 1..=count {
            self.jobs
                .push((JobId::new(format!("j{j}")), JobSpec::new(["t1"])));
        }
        self
    }

    /// Every actor, groups first.
    pub fn actors(&self) -> Vec<ActorId> {
        self.groups
            .iter()
            .cloned()
            .map(ActorId::Group)
            .chain(self.peers.iter().map(|(peer, _)| ActorId::Peer(peer.clone())))
            .collect()
    }

    /// The entry each actor starts with.
    pub(crate) fn join_requests(&self) -> Vec<(ActorId, Entry)> {
        let groups = self.groups.iter().map(|group| {
            (
                ActorId::Group(group.clone()),
                Entry::PrepareJoinCluster {
                    joiner: group.clone(),
                },
            )
        });
        let peers = self.peers.iter().map(|(peer, group)| {
            (
                ActorId::Peer(peer.clone()),
                Entry::AddVirtualPeer {
                    id: peer.clone(),
                    group: group.clone(),
                    site: PeerSite::new(format!("local://{peer}")),
                },
            )
        });
        groups.chain(peers).collect()
    }

    /// The client's submissions, in order.
    pub(crate) fn submissions(&self) -> Vec<Entry> {
        self.jobs
            .iter()
            .map(|(job, spec)| Entry::SubmitJob {
                job: job.clone(),
                spec: spec.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_names_groups_and_peers() {
        let population = Population::grid(2, 2);
        assert_eq!(population.groups, vec![GroupId::new("g1"), GroupId::new("g2")]);
        assert_eq!(population.peers.len(), 4);
        assert_eq!(population.peers[2], (PeerId::new("g2-p1"), GroupId::new("g2")));
        assert_eq!(population.actors().len(), 6);
    }

    #[test]
    fn every_actor_starts_with_a_join_request() {
        let requests = Population::grid(1, 1).join_requests();
        assert!(matches!(
            &requests[0],
            (ActorId::Group(_), Entry::PrepareJoinCluster { .. })
        ));
        assert!(matches!(
            &requests[1],
            (ActorId::Peer(_), Entry::AddVirtualPeer { site, .. }) if site.address == "local://g1-p1"
        ));
    }
}
