//! The replay model: every actor racing to append to one log.
//!
//! There is no real concurrency and no IO. Each actor owns a queue of
//! entries it wants to append; a step picks one selectable queue, applies its
//! head exactly as a peer's processing loop would, and fans the resulting
//! reactions out to the queues of the actors the entry concerns. Which queue
//! wins each step is the only source of nondeterminism, so a correct
//! protocol reaches the same replica from every seed.
//!
//! ## Usage
//!
//! ```
//! use jasper_sim::{Population, ReplayModel, ReplayOptions};
//!
//! let outcome = ReplayModel::from_population(&Population::grid(2, 2), ReplayOptions::default())
//!     .run(42)?;
//! assert_eq!(outcome.replica.peers().len(), 4);
//! # Ok::<(), jasper_sim::ReplayError>(())
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use jasper_config::ReplayConfig;
use jasper_kernel::{
    Diff, Replica, SideEffect, Slot, StallBuffer, consequences, is_multiplexed, transition,
};
use jasper_types::{ActorId, Entry, EntryKind, GroupId, LogEntry, MessageId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ReplayError, Result};
use crate::population::Population;

// ============================================================================
// Options
// ============================================================================

/// Knobs of a replay run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Applied entries after which the run is a liveness failure.
    pub ceiling: usize,
    /// Whether a started task seals its output right away.
    pub auto_seal: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self::from(&ReplayConfig::default())
    }
}

impl From<&ReplayConfig> for ReplayOptions {
    fn from(config: &ReplayConfig) -> Self {
        Self {
            ceiling: config.ceiling,
            auto_seal: config.auto_seal,
        }
    }
}

impl ReplayOptions {
    pub fn with_ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn with_auto_seal(mut self, auto_seal: bool) -> Self {
        self.auto_seal = auto_seal;
        self
    }
}

// ============================================================================
// Queues and actors
// ============================================================================

/// Owner of a pending-entry queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "kebab-case")]
pub enum QueueKey {
    /// A peer or group of the population.
    Actor(ActorId),
    /// An outside client. Only peerless entries leave its queue.
    Client(String),
}

impl Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKey::Actor(actor) => write!(f, "{actor}"),
            QueueKey::Client(name) => write!(f, "client:{name}"),
        }
    }
}

impl From<ActorId> for QueueKey {
    fn from(actor: ActorId) -> Self {
        QueueKey::Actor(actor)
    }
}

/// What the model tracks for one actor, mirroring a peer's local state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorState {
    pub stall: StallBuffer,
    pub joined: bool,
    pub watching: Option<GroupId>,
    pub running: Option<Slot>,
    pub evicted: bool,
}

/// One scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// The queue whose head was applied.
    pub selected: QueueKey,
    /// Every queue that could have been chosen.
    pub selectable: Vec<QueueKey>,
    pub message_id: MessageId,
    pub kind: EntryKind,
}

// ============================================================================
// Model
// ============================================================================

/// The replay model's full state. Cloning it forks the run.
#[derive(Debug, Clone)]
pub struct ReplayModel {
    replica: Replica,
    next_message_id: MessageId,
    queues: BTreeMap<QueueKey, VecDeque<Entry>>,
    actors: BTreeMap<ActorId, ActorState>,
    log: Vec<LogEntry>,
    history: Vec<Decision>,
    options: ReplayOptions,
}

/// How a finished run ended.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub replica: Replica,
    pub log: Vec<LogEntry>,
    pub history: Vec<Decision>,
}

impl ReplayOutcome {
    pub fn state_hash(&self) -> [u8; 32] {
        self.replica.state_hash()
    }

    /// Number of entries applied.
    pub fn applied(&self) -> usize {
        self.log.len()
    }
}

/// Serializable snapshot of a model, attached to liveness failures.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayDump {
    pub seed: Option<u64>,
    pub replica: Replica,
    pub queues: BTreeMap<String, Vec<Entry>>,
    pub actors: BTreeMap<String, ActorState>,
    pub log: Vec<LogEntry>,
    pub history: Vec<Decision>,
}

impl ReplayDump {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// `seed-<n>.json`, or `replay-<applied>.json` for an unseeded run.
    pub fn file_name(&self) -> String {
        match self.seed {
            Some(seed) => format!("seed-{seed}.json"),
            None => format!("replay-{}.json", self.log.len()),
        }
    }

    /// Writes the dump as JSON into `dir`, creating it if needed.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        let json = self.to_json().map_err(std::io::Error::other)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

impl ReplayModel {
    /// An empty model: no actors, no queues, an empty replica.
    pub fn new(options: ReplayOptions) -> Self {
        Self {
            replica: Replica::new(),
            next_message_id: MessageId::ZERO,
            queues: BTreeMap::new(),
            actors: BTreeMap::new(),
            log: Vec::new(),
            history: Vec::new(),
            options,
        }
    }

    /// A model where every actor of the population has queued its join
    /// request and the client has queued its job submissions.
    pub fn from_population(population: &Population, options: ReplayOptions) -> Self {
        let mut model = Self::new(options);
        for (actor, request) in population.join_requests() {
            model.add_actor(actor.clone());
            model.enqueue(actor, request);
        }
        for submission in population.submissions() {
            model.enqueue(QueueKey::Client("client".to_string()), submission);
        }
        model
    }

    /// Registers an actor so it observes entries, starting stalled.
    pub fn add_actor(&mut self, actor: ActorId) {
        self.actors.entry(actor).or_default();
    }

    /// Queues an entry behind the queue's current contents.
    pub fn enqueue(&mut self, key: impl Into<QueueKey>, entry: Entry) {
        self.queues.entry(key.into()).or_default().push_back(entry);
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn history(&self) -> &[Decision] {
        &self.history
    }

    pub fn actor(&self, actor: &ActorId) -> Option<&ActorState> {
        self.actors.get(actor)
    }

    /// Pending entries of one queue, oldest first.
    pub fn queue(&self, key: &QueueKey) -> impl Iterator<Item = &Entry> {
        self.queues.get(key).into_iter().flatten()
    }

    /// Total entries still queued.
    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Queues whose head may be applied next, in key order.
    pub fn selectable(&self) -> Vec<QueueKey> {
        self.queues
            .iter()
            .filter_map(|(key, queue)| {
                let head = queue.front()?;
                self.is_selectable(key, head).then(|| key.clone())
            })
            .collect()
    }

    /// Whether `head` may race for the next log position.
    ///
    /// Peerless entries always may. A group may always announce or withdraw
    /// its own join, and a peer may ask to be added once its group is in.
    /// Otherwise the author must be a recognized member; peers and groups are
    /// checked independently of each other.
    fn is_selectable(&self, key: &QueueKey, head: &Entry) -> bool {
        if head.kind().is_peerless() {
            return true;
        }
        let QueueKey::Actor(actor) = key else {
            return false;
        };
        match (actor, head) {
            (
                ActorId::Group(group),
                Entry::PrepareJoinCluster { joiner } | Entry::AbortJoinCluster { joiner },
            ) if group == joiner => return true,
            (ActorId::Peer(peer), Entry::AddVirtualPeer { id, group, .. })
                if peer == id && self.replica.has_group(group) =>
            {
                return true;
            }
            _ => {}
        }
        match actor {
            ActorId::Peer(peer) => self.replica.has_peer(peer),
            ActorId::Group(group) => {
                self.replica.has_group(group) || self.replica.is_joining(group)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------------

    /// Applies the head of `key`'s queue as the next log entry.
    ///
    /// Fails if the queue is missing or empty, or if the ceiling is passed.
    pub fn step(&mut self, key: &QueueKey) -> Result<()> {
        let selectable = self.selectable();
        let entry = self
            .queues
            .get_mut(key)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| ReplayError::UnknownQueue(key.to_string()))?;

        let message_id = self.next_message_id;
        let entry = LogEntry::at(message_id, entry);
        let transition = transition(&entry, &self.replica)?;
        tracing::trace!(
            queue = %key,
            %message_id,
            kind = %entry.kind(),
            selectable = selectable.len(),
            "applied entry"
        );

        for actor in self.active_actors(&entry.entry, &transition.diff) {
            let consequences = consequences(&entry, &self.replica, &transition, &actor);
            let Some(state) = self.actors.get_mut(&actor) else {
                continue;
            };
            let mut outgoing = state.stall.route(consequences.reactions);
            for effect in &consequences.effects {
                execute(&actor, state, effect, self.options.auto_seal, &mut outgoing);
            }

            let queue_key = QueueKey::Actor(actor.clone());
            if state.evicted {
                tracing::debug!(actor = %actor, "actor evicted, dropping its queue");
                self.queues.remove(&queue_key);
            } else if !outgoing.is_empty() {
                self.queues.entry(queue_key).or_default().extend(outgoing);
            }
        }

        self.replica = transition.replica;
        self.next_message_id = message_id.next();
        self.history.push(Decision {
            selected: key.clone(),
            selectable,
            message_id,
            kind: entry.kind(),
        });
        self.log.push(entry);

        if self.log.len() > self.options.ceiling {
            return Err(ReplayError::LivenessExceeded {
                ceiling: self.options.ceiling,
                dump: Box::new(self.dump(None)),
            });
        }
        Ok(())
    }

    /// Actors that observe an entry: those it addresses, those the diff
    /// names and, for multiplexed entries, every member. Actors outside the
    /// population or already evicted are skipped.
    fn active_actors(&self, entry: &Entry, diff: &Diff) -> Vec<ActorId> {
        let mut active: BTreeSet<ActorId> = entry.addressed().into_iter().collect();
        active.extend(diff.involved());
        if is_multiplexed(entry) {
            active.extend(self.replica.members());
        }
        active
            .into_iter()
            .filter(|actor| self.actors.get(actor).is_some_and(|state| !state.evicted))
            .collect()
    }

    /// Runs to completion, choosing uniformly among selectable queues with a
    /// ChaCha8 stream seeded by `seed`.
    pub fn run(self, seed: u64) -> Result<ReplayOutcome> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.run_with(&mut rng).map_err(|err| with_seed(err, seed))
    }

    /// Runs to completion, drawing choices from `rng`.
    pub fn run_with<R: Rng>(mut self, rng: &mut R) -> Result<ReplayOutcome> {
        loop {
            let selectable = self.selectable();
            if selectable.is_empty() {
                return self.finish();
            }
            let key = &selectable[rng.gen_range(0..selectable.len())];
            self.step(key)?;
        }
    }

    /// Ends a run with nothing selectable: done when every queue is empty,
    /// a deadlock otherwise.
    pub fn finish(self) -> Result<ReplayOutcome> {
        let pending = self.pending();
        if pending > 0 {
            tracing::warn!(pending, applied = self.log.len(), "replay deadlocked");
            return Err(ReplayError::Deadlock {
                pending,
                dump: Box::new(self.dump(None)),
            });
        }
        tracing::debug!(applied = self.log.len(), "replay drained");
        Ok(ReplayOutcome {
            replica: self.replica,
            log: self.log,
            history: self.history,
        })
    }

    pub fn dump(&self, seed: Option<u64>) -> ReplayDump {
        ReplayDump {
            seed,
            replica: self.replica.clone(),
            queues: self
                .queues
                .iter()
                .filter(|(_, queue)| !queue.is_empty())
                .map(|(key, queue)| (key.to_string(), queue.iter().cloned().collect()))
                .collect(),
            actors: self
                .actors
                .iter()
                .map(|(actor, state)| (actor.to_string(), state.clone()))
                .collect(),
            log: self.log.clone(),
            history: self.history.clone(),
        }
    }
}

/// Executes one side effect against an actor's model state, the way a peer
/// executes it against its local state.
fn execute(
    actor: &ActorId,
    state: &mut ActorState,
    effect: &SideEffect,
    auto_seal: bool,
    outgoing: &mut Vec<Entry>,
) {
    match effect {
        SideEffect::Unstall => outgoing.extend(state.stall.unstall()),
        SideEffect::Joined { watching } => {
            state.joined = true;
            state.watching = watching.clone();
        }
        SideEffect::StartTask { job, task } => {
            state.running = Some(Slot::new(job.clone(), task.clone()));
            if let Some(peer) = actor.as_peer().filter(|_| auto_seal) {
                outgoing.push(Entry::SealOutput {
                    job: job.clone(),
                    task: task.clone(),
                    peer: peer.clone(),
                });
            }
        }
        SideEffect::StopTask { job, task } => {
            if state
                .running
                .as_ref()
                .is_some_and(|slot| &slot.job == job && &slot.task == task)
            {
                state.running = None;
            }
        }
        SideEffect::Evicted => {
            state.running = None;
            state.evicted = true;
        }
    }
}

fn with_seed(err: ReplayError, seed: u64) -> ReplayError {
    match err {
        ReplayError::LivenessExceeded { ceiling, mut dump } => {
            dump.seed = Some(seed);
            ReplayError::LivenessExceeded { ceiling, dump }
        }
        ReplayError::Deadlock { pending, mut dump } => {
            dump.seed = Some(seed);
            ReplayError::Deadlock { pending, dump }
        }
        other => other,
    }
}

/// Hex rendering of a state hash.
pub fn hash_hex(hash: &[u8; 32]) -> String {
    blake3::Hash::from(*hash).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use jasper_types::{GroupId, JobId, JobSpec, PeerId, TaskId};

    use super::*;

    fn group(id: &str) -> ActorId {
        ActorId::Group(GroupId::new(id))
    }

    fn peer(id: &str) -> ActorId {
        ActorId::Peer(PeerId::new(id))
    }

    #[test]
    fn peer_waits_for_its_group() {
        let model = ReplayModel::from_population(&Population::grid(1, 1), ReplayOptions::default());
        assert_eq!(model.selectable(), vec![QueueKey::Actor(group("g1"))]);
    }

    #[test]
    fn client_submissions_are_always_selectable() {
        let population = Population::new().with_job("j1", JobSpec::new(["t1"]));
        let model = ReplayModel::from_population(&population, ReplayOptions::default());
        assert_eq!(
            model.selectable(),
            vec![QueueKey::Client("client".to_string())]
        );
    }

    #[test]
    fn client_cannot_write_member_entries() {
        let mut model = ReplayModel::new(ReplayOptions::default());
        model.enqueue(
            QueueKey::Client("client".to_string()),
            Entry::SignalReady { id: group("g1") },
        );
        assert!(model.selectable().is_empty());
        assert!(matches!(model.finish(), Err(ReplayError::Deadlock { pending: 1, .. })));
    }

    #[test]
    fn first_group_joins_and_signals_ready() {
        let mut model = ReplayModel::from_population(&Population::grid(1, 0), ReplayOptions::default());
        model.step(&QueueKey::Actor(group("g1"))).unwrap();

        assert!(model.replica().has_group(&GroupId::new("g1")));
        let state = model.actor(&group("g1")).unwrap();
        assert!(state.joined);
        assert_eq!(state.watching, None);
        assert_eq!(
            model.queue(&QueueKey::Actor(group("g1"))).collect::<Vec<_>>(),
            vec![&Entry::SignalReady { id: group("g1") }]
        );
    }

    #[test]
    fn deferred_reactions_wait_for_readiness() {
        let options = ReplayOptions::default().with_auto_seal(false);
        let mut model = ReplayModel::new(options);
        let client = QueueKey::Client("client".to_string());
        let g1 = QueueKey::Actor(group("g1"));
        let p1 = QueueKey::Actor(peer("p1"));
        let job = JobId::new("j1");
        let task = TaskId::new("t1");

        model.add_actor(group("g1"));
        model.add_actor(peer("p1"));
        model.enqueue(
            client.clone(),
            Entry::SubmitJob {
                job: job.clone(),
                spec: JobSpec::new(["t1"]),
            },
        );
        model.enqueue(
            g1.clone(),
            Entry::PrepareJoinCluster {
                joiner: GroupId::new("g1"),
            },
        );
        model.enqueue(
            p1.clone(),
            Entry::AddVirtualPeer {
                id: PeerId::new("p1"),
                group: GroupId::new("g1"),
                site: jasper_types::PeerSite::new("local://p1"),
            },
        );
        // Sealed before p1 gets to signal readiness.
        model.enqueue(
            p1.clone(),
            Entry::SealOutput {
                job: job.clone(),
                task: task.clone(),
                peer: PeerId::new("p1"),
            },
        );

        for key in [&client, &g1, &g1, &p1, &p1] {
            model.step(key).unwrap();
        }
        let complete = Entry::CompleteTask { job, task };
        let state = model.actor(&peer("p1")).unwrap();
        assert!(state.stall.is_stalled());
        assert_eq!(state.stall.buffered(), &[complete.clone()]);
        assert_eq!(
            model.queue(&p1).collect::<Vec<_>>(),
            vec![&Entry::SignalReady { id: peer("p1") }]
        );

        model.step(&p1).unwrap();
        assert!(!model.actor(&peer("p1")).unwrap().stall.is_stalled());
        assert_eq!(model.queue(&p1).collect::<Vec<_>>(), vec![&complete]);
    }

    #[test]
    fn ceiling_failure_carries_a_dump() {
        let options = ReplayOptions::default().with_ceiling(2);
        let err = ReplayModel::from_population(&Population::grid(2, 2), options)
            .run(7)
            .unwrap_err();
        let ReplayError::LivenessExceeded { ceiling, dump } = &err else {
            panic!("expected liveness failure, got {err}");
        };
        assert_eq!(*ceiling, 2);
        assert_eq!(dump.seed, Some(7));
        assert_eq!(dump.log.len(), 3);
        assert!(dump.to_json().unwrap().contains("\"history\""));
    }
}
