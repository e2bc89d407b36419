//! # jasper-types: Core types for `Jasper`
//!
//! This crate contains the shared vocabulary of the cluster-control log:
//! - Entity IDs ([`PeerId`], [`GroupId`], [`JobId`], [`TaskId`], [`ActorId`])
//! - Log positions ([`MessageId`])
//! - Job description ([`JobSpec`]) and cluster-wide settings
//!   ([`JobScheduler`], [`MessagingConfig`], [`ClusterChunk`])
//! - Data-plane locators ([`PeerSite`])
//! - Log entries ([`Entry`], [`EntryKind`], [`LogEntry`], [`LogRecord`], [`Reaction`])

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

mod entry;

pub use entry::{CodecError, Entry, EntryKind, LogEntry, LogRecord, Reaction};

// ============================================================================
// Entity IDs - string backed, ordered lexicographically
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a virtual peer: the unit that gets allocated to tasks.
    PeerId
);

string_id!(
    /// Identifier of a peer group: the process-level member of the cluster
    /// that hosts virtual peers and takes part in the join ring.
    GroupId
);

string_id!(
    /// Identifier of a submitted job.
    JobId
);

string_id!(
    /// Identifier of a task within a job.
    TaskId
);

/// Anything that can author entries and react to them.
///
/// Peers and groups are tracked independently in the replica: a peer can be
/// a member while its group is not and vice versa.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "kebab-case")]
pub enum ActorId {
    Peer(PeerId),
    Group(GroupId),
}

impl ActorId {
    /// Returns the peer ID if this actor is a virtual peer.
    pub fn as_peer(&self) -> Option<&PeerId> {
        match self {
            ActorId::Peer(id) => Some(id),
            ActorId::Group(_) => None,
        }
    }

    /// Returns the group ID if this actor is a group.
    pub fn as_group(&self) -> Option<&GroupId> {
        match self {
            ActorId::Group(id) => Some(id),
            ActorId::Peer(_) => None,
        }
    }

    pub fn is_peer(&self, peer: &PeerId) -> bool {
        self.as_peer() == Some(peer)
    }

    pub fn is_group(&self, group: &GroupId) -> bool {
        self.as_group() == Some(group)
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorId::Peer(id) => write!(f, "peer:{id}"),
            ActorId::Group(id) => write!(f, "group:{id}"),
        }
    }
}

impl From<PeerId> for ActorId {
    fn from(id: PeerId) -> Self {
        ActorId::Peer(id)
    }
}

impl From<GroupId> for ActorId {
    fn from(id: GroupId) -> Self {
        ActorId::Group(id)
    }
}

// ============================================================================
// Log Position - Copy (cheap 8-byte value)
// ============================================================================

/// Position of an entry in the log, assigned by the log at durable-append
/// time. Strictly increasing; the first appended entry has ID 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    pub const ZERO: MessageId = MessageId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the message ID that follows this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<MessageId> for u64 {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

// ============================================================================
// Peer Site
// ============================================================================

/// Opaque data-plane locator for a virtual peer.
///
/// Produced by the messenger and carried in `add-virtual-peer` so other
/// peers know how to reach this peer's data plane. The control plane never
/// interprets it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerSite {
    pub address: String,
}

impl PeerSite {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl Display for PeerSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// Description of a job as carried by `submit-job`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Tasks in declaration order. Allocation deals peers over tasks in
    /// this order.
    pub tasks: Vec<TaskId>,
    /// Upper bound on peers allocated to the job. `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saturation: Option<usize>,
    /// Peers each incomplete task needs before the job is allocated at all.
    #[serde(default = "default_min_peers_per_task")]
    pub min_peers_per_task: usize,
}

fn default_min_peers_per_task() -> usize {
    1
}

impl JobSpec {
    pub fn new<I, T>(tasks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        Self {
            tasks: tasks.into_iter().map(Into::into).collect(),
            saturation: None,
            min_peers_per_task: default_min_peers_per_task(),
        }
    }

    pub fn with_saturation(mut self, saturation: usize) -> Self {
        self.saturation = Some(saturation);
        self
    }

    pub fn with_min_peers_per_task(mut self, min: usize) -> Self {
        self.min_peers_per_task = min;
        self
    }
}

// ============================================================================
// Cluster-wide settings (published as log chunks)
// ============================================================================

/// How free peers are shared between active jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum JobScheduler {
    /// Fill jobs in submission order; later jobs get what is left.
    Greedy,
    /// Cover every job's minimum, then deal the rest one peer at a time.
    #[default]
    Balanced,
}

impl Display for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobScheduler::Greedy => f.write_str("greedy"),
            JobScheduler::Balanced => f.write_str("balanced"),
        }
    }
}

/// Data-plane transport used between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    #[default]
    InProcess,
    Tcp,
}

/// Messaging configuration shared by every peer in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct MessagingConfig {
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
}

/// Key of a cluster-wide configuration chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkKey {
    JobScheduler,
    Messaging,
}

/// Cluster-wide configuration published with first-writer-wins semantics.
///
/// Every peer writes these at boot; only the first write for a key is kept
/// and every later writer is expected to lose harmlessly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterChunk {
    JobScheduler(JobScheduler),
    Messaging(MessagingConfig),
}

impl ClusterChunk {
    pub fn key(&self) -> ChunkKey {
        match self {
            ClusterChunk::JobScheduler(_) => ChunkKey::JobScheduler,
            ClusterChunk::Messaging(_) => ChunkKey::Messaging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_order_lexicographically() {
        let mut ids = vec![PeerId::new("p10"), PeerId::new("p2"), PeerId::new("p1")];
        ids.sort();
        assert_eq!(ids, vec![PeerId::new("p1"), PeerId::new("p10"), PeerId::new("p2")]);
    }

    #[test]
    fn actor_id_display_names_its_kind() {
        assert_eq!(ActorId::from(PeerId::new("p1")).to_string(), "peer:p1");
        assert_eq!(ActorId::from(GroupId::new("g1")).to_string(), "group:g1");
    }

    #[test]
    fn actor_id_accessors() {
        let peer = ActorId::Peer(PeerId::new("p1"));
        assert!(peer.is_peer(&PeerId::new("p1")));
        assert!(!peer.is_group(&GroupId::new("p1")));
        assert_eq!(peer.as_group(), None);
    }

    #[test]
    fn message_id_next_is_strictly_greater() {
        let id = MessageId::ZERO;
        assert!(id.next() > id);
        assert_eq!(id.next().as_u64(), 1);
    }

    #[test]
    fn job_spec_defaults_to_one_peer_per_task() {
        let spec: JobSpec = serde_json::from_str(r#"{"tasks":["in","out"]}"#).unwrap();
        assert_eq!(spec.min_peers_per_task, 1);
        assert_eq!(spec.saturation, None);
        assert_eq!(spec, JobSpec::new(["in", "out"]));
    }

    #[test]
    fn chunk_key_matches_variant() {
        assert_eq!(
            ClusterChunk::JobScheduler(JobScheduler::Greedy).key(),
            ChunkKey::JobScheduler
        );
        assert_eq!(
            ClusterChunk::Messaging(MessagingConfig::default()).key(),
            ChunkKey::Messaging
        );
    }
}
