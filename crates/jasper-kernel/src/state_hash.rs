//! Deterministic state hashing for replicas.
//!
//! Two replicas that replayed logs with the same effective content hash the
//! same even if their message ids differ, which is what the replay model
//! compares across interleavings.
//!
//! # Algorithm
//!
//! BLAKE3 over every field except `last_applied`, in a fixed order. Strings
//! are length-prefixed and collections count-prefixed so adjacent fields
//! cannot alias. `BTreeMap`/`BTreeSet` iteration is sorted.

use blake3::Hasher;
use jasper_types::{JobScheduler, Transport};

use crate::state::Replica;

fn update_str(hasher: &mut Hasher, value: &str) {
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn update_len(hasher: &mut Hasher, len: usize) {
    hasher.update(&(len as u64).to_le_bytes());
}

impl Replica {
    /// Computes a deterministic hash of the replica's content.
    ///
    /// ```
    /// use jasper_kernel::Replica;
    ///
    /// assert_eq!(Replica::new().state_hash(), Replica::new().state_hash());
    /// ```
    pub fn state_hash(&self) -> [u8; 32] {
        let mut hasher = Hasher::new();

        // Membership
        update_len(&mut hasher, self.groups().len());
        for group in self.groups() {
            update_str(&mut hasher, group.as_str());
        }
        update_len(&mut hasher, self.groups_index().len());
        for (group, peers) in self.groups_index() {
            update_str(&mut hasher, group.as_str());
            update_len(&mut hasher, peers.len());
            for peer in peers {
                update_str(&mut hasher, peer.as_str());
            }
        }
        update_len(&mut hasher, self.peer_sites().len());
        for (peer, site) in self.peer_sites() {
            update_str(&mut hasher, peer.as_str());
            update_str(&mut hasher, &site.address);
        }
        update_len(&mut hasher, self.ready_peers().len());
        for peer in self.ready_peers() {
            update_str(&mut hasher, peer.as_str());
        }
        update_len(&mut hasher, self.ready_groups().len());
        for group in self.ready_groups() {
            update_str(&mut hasher, group.as_str());
        }

        // Join protocol
        for records in [self.prepared(), self.accepted()] {
            update_len(&mut hasher, records.len());
            for (watcher, joiner) in records {
                update_str(&mut hasher, watcher.as_str());
                update_str(&mut hasher, joiner.as_str());
            }
        }
        update_len(&mut hasher, self.aborted().len());
        for joiner in self.aborted() {
            update_str(&mut hasher, joiner.as_str());
        }

        // Jobs (log order is content)
        update_len(&mut hasher, self.jobs().len());
        for job in self.jobs() {
            update_str(&mut hasher, job.as_str());
            let Some(spec) = self.job_spec(job) else {
                continue;
            };
            update_len(&mut hasher, spec.tasks.len());
            for task in &spec.tasks {
                update_str(&mut hasher, task.as_str());
            }
            hasher.update(&spec.saturation.map_or(u64::MAX, |s| s as u64).to_le_bytes());
            update_len(&mut hasher, spec.min_peers_per_task);
        }
        update_len(&mut hasher, self.allocations().len());
        for (job, tasks) in self.allocations() {
            update_str(&mut hasher, job.as_str());
            update_len(&mut hasher, tasks.len());
            for (task, peers) in tasks {
                update_str(&mut hasher, task.as_str());
                update_len(&mut hasher, peers.len());
                for peer in peers {
                    update_str(&mut hasher, peer.as_str());
                }
            }
        }
        for per_job in [self.completed_tasks(), self.sealed_outputs()] {
            update_len(&mut hasher, per_job.len());
            for (job, tasks) in per_job {
                update_str(&mut hasher, job.as_str());
                update_len(&mut hasher, tasks.len());
                for task in tasks {
                    update_str(&mut hasher, task.as_str());
                }
            }
        }
        for terminal in [self.completed_jobs(), self.killed_jobs()] {
            update_len(&mut hasher, terminal.len());
            for job in terminal {
                update_str(&mut hasher, job.as_str());
            }
        }

        // Settings
        hasher.update(&[match self.job_scheduler() {
            JobScheduler::Greedy => 0u8,
            JobScheduler::Balanced => 1u8,
        }]);
        hasher.update(&[match self.messaging().transport {
            Transport::InProcess => 0u8,
            Transport::Tcp => 1u8,
        }]);
        match &self.messaging().bind_address {
            Some(address) => {
                hasher.update(&[1u8]);
                update_str(&mut hasher, address);
            }
            None => {
                hasher.update(&[0u8]);
            }
        }

        *hasher.finalize().as_bytes()
    }
}
