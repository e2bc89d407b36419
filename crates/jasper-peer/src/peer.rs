//! The peer processing loop.
//!
//! One loop per actor (a peer group or a virtual peer). It subscribes to the
//! log from the start, feeds every record through the kernel, executes the
//! planned side effects against its local state, and hands reactions to the
//! outbox through the stall policy.

use std::sync::Arc;
use std::time::Duration;

use jasper_config::JasperConfig;
use jasper_kernel::{Replica, SideEffect, Slot, StallBuffer, step};
use jasper_types::{ActorId, Entry, GroupId, LogRecord, PeerId, PeerSite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{PeerError, Result};
use crate::log::{ChunkWrite, Log, Subscription};
use crate::messenger::{LocalMessenger, Messenger};
use crate::outbox::{killed, spawn_outbox};
use crate::task::{RunningTask, TaskRunner};

// ============================================================================
// Identity and status
// ============================================================================

/// What a loop runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Member {
    /// A peer group: the process-level member that takes part in joins.
    Group(GroupId),
    /// A virtual peer hosted by a group.
    Peer { id: PeerId, group: GroupId },
}

impl Member {
    pub fn actor_id(&self) -> ActorId {
        match self {
            Member::Group(id) => ActorId::Group(id.clone()),
            Member::Peer { id, .. } => ActorId::Peer(id.clone()),
        }
    }
}

/// Lifecycle of a peer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Starting,
    Running,
    Stopped,
}

/// Commands delivered to a running loop from outside the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Unstall,
}

// ============================================================================
// Local state
// ============================================================================

/// State only this actor's loop reads or writes.
pub struct PeerLocalState {
    actor: ActorId,
    site: Option<PeerSite>,
    stall: StallBuffer,
    running: Option<Box<dyn RunningTask>>,
    joined: bool,
    watching: Option<GroupId>,
}

impl std::fmt::Debug for PeerLocalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLocalState")
            .field("actor", &self.actor)
            .field("site", &self.site)
            .field("stall", &self.stall)
            .field("running", &self.running.as_ref().map(|task| task.slot()))
            .field("joined", &self.joined)
            .field("watching", &self.watching)
            .finish()
    }
}

/// What executing one side effect asks of the loop.
#[derive(Debug, PartialEq, Eq)]
enum Executed {
    Done,
    /// Entries released from the stall buffer.
    Released(Vec<Entry>),
    Evicted,
}

impl PeerLocalState {
    /// Every actor starts stalled and not joined.
    pub fn new(actor: ActorId, site: Option<PeerSite>) -> Self {
        Self {
            actor,
            site,
            stall: StallBuffer::stalled(),
            running: None,
            joined: false,
            watching: None,
        }
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn site(&self) -> Option<&PeerSite> {
        self.site.as_ref()
    }

    pub fn is_stalled(&self) -> bool {
        self.stall.is_stalled()
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn watching(&self) -> Option<&GroupId> {
        self.watching.as_ref()
    }

    pub fn running_slot(&self) -> Option<&Slot> {
        self.running.as_ref().map(|task| task.slot())
    }

    fn unstall(&mut self) -> Vec<Entry> {
        self.stall.unstall()
    }

    fn stop_task(&mut self) {
        if let Some(mut task) = self.running.take() {
            tracing::debug!(actor = %self.actor, job = %task.slot().job, task = %task.slot().task, "stopping task");
            task.stop();
        }
    }

    fn execute<R: TaskRunner>(&mut self, effect: &SideEffect, runner: &R) -> Result<Executed> {
        match effect {
            SideEffect::Unstall => {
                let released = self.unstall();
                tracing::info!(actor = %self.actor, released = released.len(), "unstalled");
                Ok(Executed::Released(released))
            }
            SideEffect::Joined { watching } => {
                self.joined = true;
                self.watching = watching.clone();
                tracing::info!(actor = %self.actor, watching = ?self.watching, "joined cluster");
                Ok(Executed::Done)
            }
            SideEffect::StartTask { job, task } => {
                let Some(peer) = self.actor.as_peer().cloned() else {
                    return Ok(Executed::Done);
                };
                self.stop_task();
                let slot = Slot::new(job.clone(), task.clone());
                let running = runner.start(&peer, &slot)?;
                tracing::info!(actor = %self.actor, %job, %task, "started task");
                self.running = Some(running);
                Ok(Executed::Done)
            }
            SideEffect::StopTask { job, task } => {
                if self
                    .running_slot()
                    .is_some_and(|slot| &slot.job == job && &slot.task == task)
                {
                    self.stop_task();
                }
                Ok(Executed::Done)
            }
            SideEffect::Evicted => {
                self.stop_task();
                tracing::warn!(actor = %self.actor, "evicted from cluster");
                Ok(Executed::Evicted)
            }
        }
    }
}

// ============================================================================
// Startup
// ============================================================================

/// Builder for a peer loop.
pub struct Peer<L, R> {
    member: Member,
    log: Arc<L>,
    runner: Arc<R>,
    site: Option<PeerSite>,
    config: JasperConfig,
}

impl<L: Log, R: TaskRunner> Peer<L, R> {
    pub fn new(member: Member, log: Arc<L>, runner: Arc<R>) -> Self {
        Self {
            member,
            log,
            runner,
            site: None,
            config: JasperConfig::default(),
        }
    }

    pub fn with_config(mut self, config: JasperConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses the messenger to produce this peer's data-plane locator.
    pub fn with_messenger(mut self, messenger: &impl Messenger) -> Self {
        if let Member::Peer { id, .. } = &self.member {
            self.site = Some(messenger.peer_site(id));
        }
        self
    }

    /// Boots the loop: registers presence, publishes cluster chunks,
    /// subscribes from the start, spawns the outbox and processing loops and
    /// submits the join request.
    pub async fn start(self) -> Result<PeerHandle> {
        let Peer {
            member,
            log,
            runner,
            site,
            config,
        } = self;
        let actor = member.actor_id();
        let (status_tx, status_rx) = watch::channel(PeerStatus::Starting);

        log.register_presence(&actor).await?;
        for chunk in config.cluster.chunks() {
            let key = chunk.key();
            match log.write_chunk(chunk).await? {
                ChunkWrite::Written => tracing::debug!(actor = %actor, ?key, "wrote cluster chunk"),
                ChunkWrite::AlreadyPresent => {
                    tracing::debug!(actor = %actor, ?key, "cluster chunk already present");
                }
            }
        }
        let Subscription { origin, records } = log.subscribe_from_start(&actor).await?;

        let site = match &member {
            Member::Peer { id, .. } => Some(site.unwrap_or_else(|| {
                LocalMessenger::new(config.cluster.messaging.clone()).peer_site(id)
            })),
            Member::Group(_) => None,
        };
        let join = match &member {
            Member::Group(id) => PendingJoin {
                gate: None,
                entry: Entry::PrepareJoinCluster { joiner: id.clone() },
            },
            Member::Peer { id, group } => PendingJoin {
                gate: Some(group.clone()),
                entry: Entry::AddVirtualPeer {
                    id: id.clone(),
                    group: group.clone(),
                    site: site.clone().unwrap_or_else(|| PeerSite::new(id.as_str())),
                },
            },
        };

        let (kill_tx, kill_rx) = watch::channel(false);
        let (outbox_tx, outbox_rx) = mpsc::channel(config.peer.outbox_capacity);
        let (control_tx, control_rx) = mpsc::channel(config.peer.control_capacity);
        let origin = Arc::new(origin);
        let (replica_tx, replica_rx) = watch::channel(Arc::clone(&origin));

        let outbox = spawn_outbox(actor.clone(), Arc::clone(&log), outbox_rx, kill_rx.clone());

        let processing = ProcessingLoop {
            local: PeerLocalState::new(actor.clone(), site),
            join: Some(join),
            runner,
            replica: origin,
            replica_tx,
            outbox: outbox_tx,
            records,
            control: control_rx,
            kill: kill_rx,
        };
        status_tx.send_replace(PeerStatus::Running);
        tracing::info!(actor = %actor, "peer running");
        let processing = tokio::spawn(processing.run(StoppedOnDrop(status_tx)));

        Ok(PeerHandle {
            actor,
            kill: kill_tx,
            control: control_tx,
            replica: replica_rx,
            status: status_rx,
            processing: Some(processing),
            outbox: Some(outbox),
            stop_timeout: config.peer.stop_timeout(),
        })
    }
}

/// Publishes [`PeerStatus::Stopped`] however the processing task ends.
struct StoppedOnDrop(watch::Sender<PeerStatus>);

impl Drop for StoppedOnDrop {
    fn drop(&mut self) {
        self.0.send_replace(PeerStatus::Stopped);
    }
}

// ============================================================================
// Processing loop
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// The entry that asks the cluster to admit this actor.
///
/// A virtual peer can only be added through a joined group, so its request
/// waits until the replica shows the group.
struct PendingJoin {
    gate: Option<GroupId>,
    entry: Entry,
}

struct ProcessingLoop<R> {
    local: PeerLocalState,
    join: Option<PendingJoin>,
    runner: Arc<R>,
    replica: Arc<Replica>,
    replica_tx: watch::Sender<Arc<Replica>>,
    outbox: mpsc::Sender<Entry>,
    records: mpsc::UnboundedReceiver<LogRecord>,
    control: mpsc::Receiver<Control>,
    kill: watch::Receiver<bool>,
}

impl<R: TaskRunner> ProcessingLoop<R> {
    async fn run(mut self, _stopped: StoppedOnDrop) -> Result<()> {
        let actor = self.local.actor.clone();
        let result = self.process().await;
        self.local.stop_task();
        match &result {
            Ok(()) => tracing::info!(actor = %actor, "peer stopped"),
            Err(err) => tracing::error!(actor = %actor, error = %err, "peer loop failed"),
        }
        result
    }

    async fn process(&mut self) -> Result<()> {
        if self.submit_join().await? == Flow::Stop {
            return Ok(());
        }
        loop {
            let flow = tokio::select! {
                biased;

                () = killed(&mut self.kill) => Flow::Stop,
                Some(control) = self.control.recv() => self.handle_control(control).await?,
                record = self.records.recv() => match record {
                    Some(record) => match self.handle_record(record).await? {
                        Flow::Continue => self.submit_join().await?,
                        Flow::Stop => Flow::Stop,
                    },
                    None => {
                        tracing::info!(actor = %self.local.actor, "log subscription closed");
                        Flow::Stop
                    }
                },
            };
            if flow == Flow::Stop {
                return Ok(());
            }
        }
    }

    /// Submits the join request once its gate is open.
    async fn submit_join(&mut self) -> Result<Flow> {
        let open = self.join.as_ref().is_some_and(|join| {
            join.gate
                .as_ref()
                .is_none_or(|group| self.replica.has_group(group))
        });
        match self.join.take() {
            Some(join) if open => {
                tracing::debug!(actor = %self.local.actor, kind = %join.entry.kind(), "submitting join request");
                self.send_all(vec![join.entry]).await
            }
            pending => {
                self.join = pending;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_control(&mut self, control: Control) -> Result<Flow> {
        match control {
            Control::Unstall => {
                let released = self.local.unstall();
                tracing::info!(actor = %self.local.actor, released = released.len(), "unstalled by control");
                self.send_all(released).await
            }
        }
    }

    async fn handle_record(&mut self, record: LogRecord) -> Result<Flow> {
        let entry = record.decode()?;
        let (transition, consequences) = step(&entry, &self.replica, &self.local.actor)?;
        tracing::debug!(
            actor = %self.local.actor,
            message_id = %record.message_id,
            kind = %entry.kind(),
            reactions = consequences.reactions.len(),
            effects = consequences.effects.len(),
            "applied entry"
        );

        let replica = Arc::new(transition.replica);
        self.replica = Arc::clone(&replica);
        self.replica_tx.send_replace(replica);

        let mut outgoing = self.local.stall.route(consequences.reactions);
        let mut flow = Flow::Continue;
        for effect in &consequences.effects {
            match self.local.execute(effect, self.runner.as_ref())? {
                Executed::Done => {}
                Executed::Released(released) => outgoing.extend(released),
                Executed::Evicted => flow = Flow::Stop,
            }
        }

        if self.send_all(outgoing).await? == Flow::Stop {
            return Ok(Flow::Stop);
        }
        Ok(flow)
    }

    /// Queues entries on the outbox in order, giving up if killed while the
    /// queue is full.
    async fn send_all(&mut self, entries: Vec<Entry>) -> Result<Flow> {
        for entry in entries {
            tokio::select! {
                biased;

                () = killed(&mut self.kill) => return Ok(Flow::Stop),
                sent = self.outbox.send(entry) => sent.map_err(|_| PeerError::OutboxClosed)?,
            }
        }
        Ok(Flow::Continue)
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Owner's handle to a running peer.
///
/// Dropping the handle drops the kill signal, which also stops the loops.
pub struct PeerHandle {
    actor: ActorId,
    kill: watch::Sender<bool>,
    control: mpsc::Sender<Control>,
    replica: watch::Receiver<Arc<Replica>>,
    status: watch::Receiver<PeerStatus>,
    processing: Option<JoinHandle<Result<()>>>,
    outbox: Option<JoinHandle<Result<()>>>,
    stop_timeout: Duration,
}

impl PeerHandle {
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.borrow()
    }

    /// The most recently published replica.
    pub fn replica(&self) -> Arc<Replica> {
        Arc::clone(&self.replica.borrow())
    }

    /// A receiver notified on every replica change.
    pub fn subscribe_replica(&self) -> watch::Receiver<Arc<Replica>> {
        self.replica.clone()
    }

    /// Waits until the published replica satisfies `predicate`.
    pub async fn wait_for_replica(
        &self,
        mut predicate: impl FnMut(&Replica) -> bool,
    ) -> Result<Arc<Replica>> {
        let mut replica = self.replica.clone();
        let found = replica
            .wait_for(|current| predicate(current))
            .await
            .map_err(|_| PeerError::Stopped)?;
        Ok(Arc::clone(&found))
    }

    /// Waits until the loop reports the given status.
    pub async fn wait_for_status(&self, status: PeerStatus) -> Result<()> {
        let mut rx = self.status.clone();
        match rx.wait_for(|current| *current == status).await {
            Ok(_) => Ok(()),
            // The sender is dropped only once the loop has stopped.
            Err(_) if status == PeerStatus::Stopped => Ok(()),
            Err(_) => Err(PeerError::Stopped),
        }
    }

    /// Releases deferred reactions without waiting for this actor's own
    /// readiness signal.
    pub async fn unstall(&self) -> Result<()> {
        self.control
            .send(Control::Unstall)
            .await
            .map_err(|_| PeerError::Stopped)
    }

    /// Stops both loops. Idempotent, and safe after the loop already died.
    ///
    /// Each loop gets the configured timeout to finish before it is aborted,
    /// and an aborted loop is awaited so nothing outlives this call.
    /// Returns an error only if a loop task panicked.
    pub async fn stop(&mut self) -> Result<()> {
        self.kill.send_replace(true);

        let mut failure = None;
        for (name, handle) in [
            ("processing", self.processing.take()),
            ("outbox", self.outbox.take()),
        ] {
            let Some(mut handle) = handle else {
                continue;
            };
            match tokio::time::timeout(self.stop_timeout, &mut handle).await {
                Ok(Ok(_)) => {}
                Ok(Err(join_err)) => {
                    tracing::error!(actor = %self.actor, task = name, error = %join_err, "peer task panicked");
                    failure.get_or_insert(PeerError::Join(join_err.to_string()));
                }
                Err(_) => {
                    tracing::warn!(actor = %self.actor, task = name, "peer task did not stop in time, aborting");
                    handle.abort();
                    // Cancellation is the expected outcome; a panic still counts.
                    match handle.await {
                        Err(join_err) if join_err.is_panic() => {
                            failure.get_or_insert(PeerError::Join(join_err.to_string()));
                        }
                        _ => {}
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("actor", &self.actor)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
