//! Convergence and liveness of the join and job protocols under the replay
//! model.

use jasper_sim::{
    Population, QueueKey, ReplayError, ReplayModel, ReplayOptions, check_convergence, explore,
    hash_hex,
};
use jasper_types::{ActorId, Entry, GroupId, JobId, JobSpec, PeerId, PeerSite};
use proptest::prelude::*;
use test_case::test_case;

fn group(id: &str) -> ActorId {
    ActorId::Group(GroupId::new(id))
}

fn peer(id: &str) -> ActorId {
    ActorId::Peer(PeerId::new(id))
}

/// Steps the first selectable queue until nothing is selectable.
fn drain(model: &mut ReplayModel) {
    while let Some(key) = model.selectable().into_iter().next() {
        model.step(&key).unwrap();
    }
}

#[test]
fn single_join_adds_group_then_peer() {
    let mut model = ReplayModel::new(ReplayOptions::default());
    model.add_actor(group("g1"));
    model.add_actor(peer("p1"));
    model.enqueue(
        group("g1"),
        Entry::PrepareJoinCluster {
            joiner: GroupId::new("g1"),
        },
    );
    model.enqueue(
        peer("p1"),
        Entry::AddVirtualPeer {
            id: PeerId::new("p1"),
            group: GroupId::new("g1"),
            site: PeerSite::new("local://p1"),
        },
    );

    model.step(&QueueKey::Actor(group("g1"))).unwrap();
    assert!(model.replica().has_group(&GroupId::new("g1")));
    model.step(&QueueKey::Actor(peer("p1"))).unwrap();
    assert!(model.replica().has_peer(&PeerId::new("p1")));
    assert_eq!(model.replica().group_of(&PeerId::new("p1")), Some(&GroupId::new("g1")));

    drain(&mut model);
    let outcome = model.finish().unwrap();
    assert!(outcome.replica.is_ready(&group("g1")));
    assert!(outcome.replica.is_ready(&peer("p1")));
}

#[test]
fn two_by_two_drains_well_under_the_ceiling() {
    let convergence =
        check_convergence(&Population::grid(2, 2), ReplayOptions::default(), 0..32).unwrap();
    assert_eq!(convergence.runs, 32);
    assert!(convergence.max_applied < 1000, "{convergence:?}");
}

#[test]
fn racing_groups_both_join_exactly_once() {
    let population = Population::grid(2, 1);
    for seed in 0..64 {
        let outcome = ReplayModel::from_population(&population, ReplayOptions::default())
            .run(seed)
            .unwrap();
        let replica = &outcome.replica;
        assert_eq!(replica.groups().len(), 2, "seed {seed}");
        assert_eq!(replica.peers().len(), 2, "seed {seed}");
        assert!(replica.prepared().is_empty(), "seed {seed}");
        assert!(replica.accepted().is_empty(), "seed {seed}");
        assert!(replica.aborted().is_empty(), "seed {seed}");

        let joins = outcome
            .log
            .iter()
            .filter(|entry| matches!(entry.entry, Entry::AcceptJoinCluster { .. }))
            .count();
        assert_eq!(joins, 1, "seed {seed}: only the second group needs a watcher");
    }
}

#[test_case(1, 3, 0 ; "one group")]
#[test_case(2, 2, 1 ; "two groups one job")]
#[test_case(3, 2, 0 ; "three groups")]
#[test_case(3, 1, 2 ; "three groups two jobs")]
fn seeds_agree_on_the_terminal_replica(groups: usize, peers: usize, jobs: usize) {
    let population = Population::grid(groups, peers).with_jobs(jobs);
    let convergence = check_convergence(&population, ReplayOptions::default(), 0..16).unwrap();
    assert_eq!(convergence.runs, 16);
}

#[test]
fn jobs_run_to_completion() {
    let population = Population::grid(2, 2)
        .with_job("j1", JobSpec::new(["a", "b"]))
        .with_job("j2", JobSpec::new(["c"]).with_saturation(1));
    let outcome = ReplayModel::from_population(&population, ReplayOptions::default())
        .run(3)
        .unwrap();

    for job in ["j1", "j2"] {
        assert!(outcome.replica.completed_jobs().contains(&JobId::new(job)));
    }
    assert!(outcome.replica.allocations().is_empty());
}

#[test]
fn without_auto_seal_jobs_stay_allocated() {
    let population = Population::grid(1, 2).with_jobs(1);
    let options = ReplayOptions::default().with_auto_seal(false);
    let outcome = ReplayModel::from_population(&population, options)
        .run(0)
        .unwrap();
    assert!(outcome.replica.completed_jobs().is_empty());
    assert!(outcome.replica.slot_of(&PeerId::new("g1-p1")).is_some());
}

#[test]
fn exceeding_the_ceiling_is_a_liveness_failure() {
    let options = ReplayOptions::default().with_ceiling(5);
    let err = ReplayModel::from_population(&Population::grid(2, 2), options)
        .run(11)
        .unwrap_err();

    assert!(matches!(err, ReplayError::LivenessExceeded { ceiling: 5, .. }));
    let dump = err.dump().unwrap();
    assert_eq!(dump.seed, Some(11));
    assert_eq!(dump.history.len(), 6);
    let json: serde_json::Value = serde_json::from_str(&dump.to_json().unwrap()).unwrap();
    assert_eq!(json["seed"], 11);
    assert!(json["queues"].as_object().is_some_and(|queues| !queues.is_empty()));
}

#[test]
fn liveness_dump_is_written_under_its_seed() {
    let dir = tempfile::tempdir().unwrap();
    let dumps = dir.path().join("dumps");
    let options = ReplayOptions::default().with_ceiling(3);
    let err = ReplayModel::from_population(&Population::grid(1, 2), options)
        .run(7)
        .unwrap_err();

    let path = err.dump().unwrap().write_to(&dumps).unwrap();
    assert_eq!(path, dumps.join("seed-7.json"));

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written["seed"], 7);
    assert_eq!(written["log"].as_array().map(Vec::len), Some(4));
}

#[test]
fn peer_of_an_absent_group_deadlocks() {
    let population = Population::grid(1, 1).with_peer("stray", "ghost");
    let err = ReplayModel::from_population(&population, ReplayOptions::default())
        .run(0)
        .unwrap_err();
    let ReplayError::Deadlock { pending, dump } = err else {
        panic!("expected a deadlock");
    };
    assert_eq!(pending, 1);
    assert!(dump.queues.contains_key("peer:stray"));
}

#[test]
fn group_leave_evicts_group_and_its_peers() {
    let mut model = ReplayModel::from_population(&Population::grid(2, 1), ReplayOptions::default());
    drain(&mut model);

    model.enqueue(
        group("g1"),
        Entry::GroupLeaveCluster {
            id: GroupId::new("g2"),
        },
    );
    drain(&mut model);

    assert!(!model.replica().has_group(&GroupId::new("g2")));
    assert!(!model.replica().has_peer(&PeerId::new("g2-p1")));
    assert!(model.actor(&group("g2")).unwrap().evicted);
    assert!(model.actor(&peer("g2-p1")).unwrap().evicted);
    assert!(!model.actor(&group("g1")).unwrap().evicted);
    let outcome = model.finish().unwrap();
    assert_eq!(outcome.replica.groups().len(), 1);
}

#[test]
fn explored_interleavings_match_sampled_seeds() {
    let population = Population::grid(2, 1);
    let exploration = explore(&population, ReplayOptions::default(), 256).unwrap();
    let convergence = check_convergence(&population, ReplayOptions::default(), 0..4).unwrap();

    assert!(exploration.paths > 1);
    assert_eq!(exploration.state_hash, Some(convergence.state_hash));
}

#[test]
fn history_records_every_decision() {
    let outcome = ReplayModel::from_population(&Population::grid(2, 2), ReplayOptions::default())
        .run(5)
        .unwrap();
    assert_eq!(outcome.history.len(), outcome.log.len());
    for (decision, entry) in outcome.history.iter().zip(&outcome.log) {
        assert!(decision.selectable.contains(&decision.selected));
        assert_eq!(Some(decision.message_id), entry.message_id);
        assert_eq!(decision.kind, entry.kind());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn terminal_state_does_not_depend_on_the_seed(seed in any::<u64>()) {
        let population = Population::grid(2, 2).with_jobs(1);
        let reference = ReplayModel::from_population(&population, ReplayOptions::default())
            .run(0)
            .unwrap();
        let outcome = ReplayModel::from_population(&population, ReplayOptions::default())
            .run(seed)
            .unwrap();
        prop_assert_eq!(
            hash_hex(&outcome.state_hash()),
            hash_hex(&reference.state_hash())
        );
    }
}
