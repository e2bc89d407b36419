//! Deterministic allocation of virtual peers to job tasks.
//!
//! Allocations are recomputed from scratch after every entry that touches
//! membership, readiness or jobs. The result depends only on the replica, so
//! every peer computes the same allocation for the same log prefix.

use std::collections::BTreeMap;

use jasper_types::{JobId, JobScheduler, PeerId, TaskId};
use serde::{Deserialize, Serialize};

use crate::state::Replica;

/// Task -> allocated peers (sorted).
pub type TaskAllocations = BTreeMap<TaskId, Vec<PeerId>>;

/// Job -> task allocations.
pub type Allocations = BTreeMap<JobId, TaskAllocations>;

/// A job/task pair a peer can be allocated to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub job: JobId,
    pub task: TaskId,
}

impl Slot {
    pub fn new(job: JobId, task: TaskId) -> Self {
        Self { job, task }
    }
}

/// What one active job asks of the scheduler.
#[derive(Debug)]
struct Demand<'a> {
    job: &'a JobId,
    tasks: Vec<&'a TaskId>,
    /// Peers required before the job is allocated at all.
    min: usize,
    /// Peers the job can use at most.
    cap: usize,
}

impl Demand<'_> {
    /// A job whose saturation is below its minimum can never be covered.
    fn is_coverable(&self) -> bool {
        self.min <= self.cap
    }
}

/// Computes allocations for every active job.
pub fn allocate(replica: &Replica) -> Allocations {
    let peers = replica.schedulable_peers();
    let demands: Vec<Demand<'_>> = replica
        .active_jobs()
        .filter_map(|job| demand(replica, job))
        .collect();

    let counts = match replica.job_scheduler() {
        JobScheduler::Greedy => greedy(&demands, peers.len()),
        JobScheduler::Balanced => balanced(&demands, peers.len()),
    };
    debug_assert!(counts.iter().sum::<usize>() <= peers.len());

    let mut allocations = Allocations::new();
    let mut free = peers.into_iter();
    for (demand, count) in demands.iter().zip(counts) {
        if count == 0 {
            continue;
        }
        let mut tasks: TaskAllocations = demand
            .tasks
            .iter()
            .map(|task| ((*task).clone(), Vec::new()))
            .collect();
        for (i, peer) in free.by_ref().take(count).enumerate() {
            let task = demand.tasks[i % demand.tasks.len()];
            if let Some(assigned) = tasks.get_mut(task) {
                assigned.push(peer.clone());
            }
        }
        for assigned in tasks.values_mut() {
            assigned.sort();
        }
        allocations.insert(demand.job.clone(), tasks);
    }
    allocations
}

fn demand<'a>(replica: &'a Replica, job: &'a JobId) -> Option<Demand<'a>> {
    let spec = replica.job_spec(job)?;
    let tasks = replica.incomplete_tasks(job);
    if tasks.is_empty() {
        return None;
    }
    // A minimum too large to count can never be covered.
    let min = spec.min_peers_per_task.max(1).checked_mul(tasks.len())?;
    let cap = spec.saturation.unwrap_or(usize::MAX);
    Some(Demand {
        job,
        tasks,
        min,
        cap,
    })
}

/// Fills jobs in log order; a job takes as much as it can use.
fn greedy(demands: &[Demand<'_>], available: usize) -> Vec<usize> {
    let mut remaining = available;
    demands
        .iter()
        .map(|demand| {
            if !demand.is_coverable() || remaining < demand.min {
                return 0;
            }
            let take = demand.cap.min(remaining);
            remaining -= take;
            take
        })
        .collect()
}

/// Covers every coverable job's minimum in log order, then deals the
/// remaining peers one at a time across covered jobs.
fn balanced(demands: &[Demand<'_>], available: usize) -> Vec<usize> {
    let mut remaining = available;
    let mut counts: Vec<usize> = demands
        .iter()
        .map(|demand| {
            if !demand.is_coverable() || remaining < demand.min {
                return 0;
            }
            remaining -= demand.min;
            demand.min
        })
        .collect();

    while remaining > 0 {
        let mut progressed = false;
        for (demand, count) in demands.iter().zip(counts.iter_mut()) {
            if remaining == 0 {
                break;
            }
            if *count > 0 && *count < demand.cap {
                *count += 1;
                remaining -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    counts
}
