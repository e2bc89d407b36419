//! End-to-end tests of the peer loops over the in-memory log.

use std::sync::Arc;
use std::time::Duration;

use jasper_config::JasperConfig;
use jasper_kernel::Replica;
use jasper_peer::{
    ChunkWrite, InMemoryLog, Log, LogError, Member, NoopTaskRunner, Peer, PeerError, PeerHandle,
    PeerStatus, Subscription, TaskEvent,
};
use jasper_types::{
    ActorId, ClusterChunk, Entry, GroupId, JobId, JobSpec, MessageId, PeerId, TaskId,
};
use tokio::sync::Notify;

const WAIT: Duration = Duration::from_secs(5);

fn group(id: &str) -> Member {
    Member::Group(GroupId::new(id))
}

fn peer(id: &str, group: &str) -> Member {
    Member::Peer {
        id: PeerId::new(id),
        group: GroupId::new(group),
    }
}

async fn start(member: Member, log: &Arc<InMemoryLog>, runner: &Arc<NoopTaskRunner>) -> PeerHandle {
    Peer::new(member, Arc::clone(log), Arc::clone(runner))
        .with_config(JasperConfig::testing())
        .start()
        .await
        .expect("peer starts")
}

async fn wait_for(handle: &PeerHandle, predicate: impl FnMut(&Replica) -> bool) -> Arc<Replica> {
    tokio::time::timeout(WAIT, handle.wait_for_replica(predicate))
        .await
        .expect("replica condition reached in time")
        .expect("peer still running")
}

fn all_ready(replica: &Replica, groups: &[&str], peers: &[&str]) -> bool {
    groups
        .iter()
        .all(|g| replica.is_ready(&ActorId::Group(GroupId::new(*g))))
        && peers
            .iter()
            .all(|p| replica.is_ready(&ActorId::Peer(PeerId::new(*p))))
}

#[tokio::test]
async fn single_group_joins_instantly_and_becomes_ready() {
    let log = Arc::new(InMemoryLog::new());
    let runner = Arc::new(NoopTaskRunner::new());
    let mut g1 = start(group("g1"), &log, &runner).await;

    let replica = wait_for(&g1, |r| r.is_ready(&ActorId::Group(GroupId::new("g1")))).await;
    assert!(replica.has_group(&GroupId::new("g1")));
    assert_eq!(g1.status(), PeerStatus::Running);
    assert!(log.present().contains(&ActorId::Group(GroupId::new("g1"))));

    g1.stop().await.unwrap();
}

#[tokio::test]
async fn two_groups_with_peers_converge() {
    let log = Arc::new(InMemoryLog::new());
    let runner = Arc::new(NoopTaskRunner::new());
    let members = [
        group("g1"),
        group("g2"),
        peer("p1", "g1"),
        peer("p2", "g1"),
        peer("p3", "g2"),
        peer("p4", "g2"),
    ];

    let mut handles = Vec::new();
    for member in members {
        handles.push(start(member, &log, &runner).await);
    }

    let groups = ["g1", "g2"];
    let peers = ["p1", "p2", "p3", "p4"];
    for handle in &handles {
        wait_for(handle, |r| all_ready(r, &groups, &peers)).await;
    }

    // Readiness is the last thing anyone writes, so the log is now quiet.
    let last = MessageId::new(log.len() as u64 - 1);
    let mut hashes = Vec::new();
    for handle in &handles {
        let replica = wait_for(handle, |r| r.last_applied() == Some(last)).await;
        assert_eq!(replica.groups().len(), 2);
        assert_eq!(replica.peers().len(), 4);
        assert!(replica.prepared().is_empty());
        assert!(replica.accepted().is_empty());
        hashes.push(replica.state_hash());
    }
    assert!(hashes.windows(2).all(|pair| pair[0] == pair[1]));

    for handle in &mut handles {
        handle.stop().await.unwrap();
    }
}

#[tokio::test]
async fn sealed_task_completes_its_job() {
    let log = Arc::new(InMemoryLog::new());
    let runner = Arc::new(NoopTaskRunner::new());
    let mut g1 = start(group("g1"), &log, &runner).await;
    let mut p1 = start(peer("p1", "g1"), &log, &runner).await;
    wait_for(&p1, |r| all_ready(r, &["g1"], &["p1"])).await;

    let job = JobId::new("j1");
    let task = TaskId::new("t");
    log.append(&Entry::SubmitJob {
        job: job.clone(),
        spec: JobSpec::new(["t"]),
    })
    .await
    .unwrap();
    wait_for(&p1, |r| r.slot_of(&PeerId::new("p1")).is_some()).await;

    log.append(&Entry::SealOutput {
        job: job.clone(),
        task: task.clone(),
        peer: PeerId::new("p1"),
    })
    .await
    .unwrap();
    let replica = wait_for(&p1, |r| r.completed_jobs().contains(&job)).await;
    assert!(replica.allocations().is_empty());

    // The stop effect runs after the replica is published.
    p1.stop().await.unwrap();
    g1.stop().await.unwrap();
    let events = runner.events();
    assert!(matches!(
        events.as_slice(),
        [TaskEvent::Started { .. }, TaskEvent::Stopped { .. }]
    ));
}

#[tokio::test]
async fn deferred_reactions_wait_for_readiness() {
    // The seal is in the log before p1 starts, so p1 observes it while
    // stalled and can only write complete-task after its own signal-ready.
    let log = Arc::new(InMemoryLog::new());
    let runner = Arc::new(NoopTaskRunner::new());
    let job = JobId::new("j1");
    log.append(&Entry::SubmitJob {
        job: job.clone(),
        spec: JobSpec::new(["t"]),
    })
    .await
    .unwrap();
    log.append(&Entry::SealOutput {
        job: job.clone(),
        task: TaskId::new("t"),
        peer: PeerId::new("p1"),
    })
    .await
    .unwrap();

    let mut g1 = start(group("g1"), &log, &runner).await;
    let mut p1 = start(peer("p1", "g1"), &log, &runner).await;
    wait_for(&p1, |r| r.completed_jobs().contains(&job)).await;

    let kinds: Vec<String> = log
        .records()
        .iter()
        .map(|record| record.decode().unwrap().kind().to_string())
        .collect();
    let ready = kinds
        .iter()
        .rposition(|kind| kind == "signal-ready")
        .unwrap();
    let complete = kinds.iter().position(|kind| kind == "complete-task").unwrap();
    assert!(ready < complete, "complete-task written before readiness: {kinds:?}");

    p1.stop().await.unwrap();
    g1.stop().await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent() {
    let log = Arc::new(InMemoryLog::new());
    let runner = Arc::new(NoopTaskRunner::new());
    let mut g1 = start(group("g1"), &log, &runner).await;

    g1.stop().await.unwrap();
    g1.stop().await.unwrap();
    assert_eq!(g1.status(), PeerStatus::Stopped);
    assert!(matches!(g1.unstall().await, Err(PeerError::Stopped)));
}

#[tokio::test]
async fn external_unstall_is_accepted_while_running() {
    let log = Arc::new(InMemoryLog::new());
    let runner = Arc::new(NoopTaskRunner::new());
    let mut g1 = start(group("g1"), &log, &runner).await;

    g1.unstall().await.unwrap();
    g1.unstall().await.unwrap();
    assert_eq!(g1.status(), PeerStatus::Running);

    g1.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_entry_kind_stops_the_loop() {
    let log = Arc::new(InMemoryLog::new());
    let runner = Arc::new(NoopTaskRunner::new());
    let mut g1 = start(group("g1"), &log, &runner).await;

    log.append_raw(r#"{"fn":"rebalance","args":{}}"#).unwrap();
    tokio::time::timeout(WAIT, g1.wait_for_status(PeerStatus::Stopped))
        .await
        .expect("loop stopped in time")
        .unwrap();

    // Stopping a peer whose loop already died neither hangs nor fails.
    g1.stop().await.unwrap();
    g1.stop().await.unwrap();
}

#[tokio::test]
async fn closed_log_stops_the_loop() {
    let log = Arc::new(InMemoryLog::new());
    let runner = Arc::new(NoopTaskRunner::new());
    let mut g1 = start(group("g1"), &log, &runner).await;
    wait_for(&g1, |r| r.has_group(&GroupId::new("g1"))).await;

    log.close();
    tokio::time::timeout(WAIT, g1.wait_for_status(PeerStatus::Stopped))
        .await
        .expect("loop stopped in time")
        .unwrap();
    g1.stop().await.unwrap();
}

#[tokio::test]
async fn evicted_peer_stops() {
    let log = Arc::new(InMemoryLog::new());
    let runner = Arc::new(NoopTaskRunner::new());
    let mut g1 = start(group("g1"), &log, &runner).await;
    let mut p1 = start(peer("p1", "g1"), &log, &runner).await;
    wait_for(&p1, |r| r.has_peer(&PeerId::new("p1"))).await;

    log.append(&Entry::LeaveCluster {
        id: PeerId::new("p1"),
    })
    .await
    .unwrap();
    tokio::time::timeout(WAIT, p1.wait_for_status(PeerStatus::Stopped))
        .await
        .expect("evicted peer stopped in time")
        .unwrap();
    assert_eq!(g1.status(), PeerStatus::Running);

    p1.stop().await.unwrap();
    g1.stop().await.unwrap();
}

/// A log whose appends never complete.
struct StuckLog {
    log: InMemoryLog,
    appending: Notify,
}

impl Log for StuckLog {
    async fn register_presence(&self, actor: &ActorId) -> Result<(), LogError> {
        self.log.register_presence(actor).await
    }

    async fn write_chunk(&self, chunk: ClusterChunk) -> Result<ChunkWrite, LogError> {
        self.log.write_chunk(chunk).await
    }

    async fn subscribe_from_start(&self, actor: &ActorId) -> Result<Subscription, LogError> {
        self.log.subscribe_from_start(actor).await
    }

    async fn append(&self, _entry: &Entry) -> Result<MessageId, LogError> {
        self.appending.notify_one();
        std::future::pending().await
    }
}

#[tokio::test]
async fn stop_aborts_and_reaps_a_stuck_outbox() {
    let log = Arc::new(StuckLog {
        log: InMemoryLog::new(),
        appending: Notify::new(),
    });
    let mut config = JasperConfig::testing();
    config.peer.stop_timeout_ms = 50;
    let mut g1 = Peer::new(group("g1"), Arc::clone(&log), Arc::new(NoopTaskRunner::new()))
        .with_config(config)
        .start()
        .await
        .unwrap();

    // The join request is stuck in the outbox's append.
    tokio::time::timeout(WAIT, log.appending.notified())
        .await
        .expect("join request reached the log");
    assert_eq!(Arc::strong_count(&log), 2);

    g1.stop().await.unwrap();
    assert_eq!(g1.status(), PeerStatus::Stopped);
    // The aborted outbox dropped its handle on the log.
    assert_eq!(Arc::strong_count(&log), 1);
}
