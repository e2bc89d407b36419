//! Log entries and their wire encoding.
//!
//! Every control record in the log is one [`Entry`] variant. The wire shape
//! is a JSON object `{"fn": "<kind>", "args": {...}}`; the log assigns the
//! [`MessageId`] when the record becomes durable, so it travels next to the
//! payload in a [`LogRecord`] rather than inside it.

use std::fmt::Display;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ActorId, GroupId, JobId, JobSpec, MessageId, PeerId, PeerSite, TaskId};

// ============================================================================
// Entry
// ============================================================================

/// A cluster-control entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fn", content = "args", rename_all = "kebab-case")]
pub enum Entry {
    /// A group announces it wants to join the cluster.
    PrepareJoinCluster { joiner: GroupId },
    /// The watcher chosen for a joiner confirms it will watch it.
    NotifyJoinCluster { joiner: GroupId, watcher: GroupId },
    /// The joiner completes its join.
    AcceptJoinCluster { joiner: GroupId, watcher: GroupId },
    /// The joiner withdraws a prepare that found no watcher.
    AbortJoinCluster { joiner: GroupId },
    /// A virtual peer joins through its (already joined) group.
    AddVirtualPeer {
        id: PeerId,
        group: GroupId,
        site: PeerSite,
    },
    /// A virtual peer leaves the cluster.
    LeaveCluster { id: PeerId },
    /// A group and every peer it hosts leave the cluster.
    GroupLeaveCluster { id: GroupId },
    /// An actor reports it is ready for ordinary protocol traffic.
    SignalReady { id: ActorId },
    SubmitJob { job: JobId, spec: JobSpec },
    KillJob { job: JobId },
    /// A peer reports that a task's input is exhausted.
    SealOutput {
        job: JobId,
        task: TaskId,
        peer: PeerId,
    },
    CompleteTask { job: JobId, task: TaskId },
    /// Drops bookkeeping for completed and killed jobs.
    Gc,
}

/// Discriminant of [`Entry`], used for dispatch tables and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    PrepareJoinCluster,
    NotifyJoinCluster,
    AcceptJoinCluster,
    AbortJoinCluster,
    AddVirtualPeer,
    LeaveCluster,
    GroupLeaveCluster,
    SignalReady,
    SubmitJob,
    KillJob,
    SealOutput,
    CompleteTask,
    Gc,
}

impl EntryKind {
    pub const ALL: [EntryKind; 13] = [
        EntryKind::PrepareJoinCluster,
        EntryKind::NotifyJoinCluster,
        EntryKind::AcceptJoinCluster,
        EntryKind::AbortJoinCluster,
        EntryKind::AddVirtualPeer,
        EntryKind::LeaveCluster,
        EntryKind::GroupLeaveCluster,
        EntryKind::SignalReady,
        EntryKind::SubmitJob,
        EntryKind::KillJob,
        EntryKind::SealOutput,
        EntryKind::CompleteTask,
        EntryKind::Gc,
    ];

    /// The wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::PrepareJoinCluster => "prepare-join-cluster",
            EntryKind::NotifyJoinCluster => "notify-join-cluster",
            EntryKind::AcceptJoinCluster => "accept-join-cluster",
            EntryKind::AbortJoinCluster => "abort-join-cluster",
            EntryKind::AddVirtualPeer => "add-virtual-peer",
            EntryKind::LeaveCluster => "leave-cluster",
            EntryKind::GroupLeaveCluster => "group-leave-cluster",
            EntryKind::SignalReady => "signal-ready",
            EntryKind::SubmitJob => "submit-job",
            EntryKind::KillJob => "kill-job",
            EntryKind::SealOutput => "seal-output",
            EntryKind::CompleteTask => "complete-task",
            EntryKind::Gc => "gc",
        }
    }

    /// Entries that can be written by actors that are not cluster members.
    pub fn is_peerless(self) -> bool {
        matches!(self, EntryKind::SubmitJob | EntryKind::KillJob | EntryKind::Gc)
    }
}

impl Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CodecError::UnknownEntryKind(s.to_string()))
    }
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        match self {
            Entry::PrepareJoinCluster { .. } => EntryKind::PrepareJoinCluster,
            Entry::NotifyJoinCluster { .. } => EntryKind::NotifyJoinCluster,
            Entry::AcceptJoinCluster { .. } => EntryKind::AcceptJoinCluster,
            Entry::AbortJoinCluster { .. } => EntryKind::AbortJoinCluster,
            Entry::AddVirtualPeer { .. } => EntryKind::AddVirtualPeer,
            Entry::LeaveCluster { .. } => EntryKind::LeaveCluster,
            Entry::GroupLeaveCluster { .. } => EntryKind::GroupLeaveCluster,
            Entry::SignalReady { .. } => EntryKind::SignalReady,
            Entry::SubmitJob { .. } => EntryKind::SubmitJob,
            Entry::KillJob { .. } => EntryKind::KillJob,
            Entry::SealOutput { .. } => EntryKind::SealOutput,
            Entry::CompleteTask { .. } => EntryKind::CompleteTask,
            Entry::Gc => EntryKind::Gc,
        }
    }

    /// Actors this entry is about, independent of any replica.
    ///
    /// Multiplexed entries address nobody in particular and return an empty
    /// list; their audience is decided by the caller.
    pub fn addressed(&self) -> Vec<ActorId> {
        match self {
            Entry::PrepareJoinCluster { joiner }
            | Entry::NotifyJoinCluster { joiner, .. }
            | Entry::AbortJoinCluster { joiner } => vec![ActorId::Group(joiner.clone())],
            Entry::AcceptJoinCluster { joiner, watcher } => vec![
                ActorId::Group(joiner.clone()),
                ActorId::Group(watcher.clone()),
            ],
            Entry::AddVirtualPeer { id, group, .. } => {
                vec![ActorId::Peer(id.clone()), ActorId::Group(group.clone())]
            }
            Entry::LeaveCluster { id } => vec![ActorId::Peer(id.clone())],
            Entry::GroupLeaveCluster { id } => vec![ActorId::Group(id.clone())],
            Entry::SignalReady { id } => vec![id.clone()],
            Entry::SealOutput { peer, .. } => vec![ActorId::Peer(peer.clone())],
            Entry::SubmitJob { .. }
            | Entry::KillJob { .. }
            | Entry::CompleteTask { .. }
            | Entry::Gc => Vec::new(),
        }
    }

    /// Encodes the entry into its wire payload.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(CodecError::Encode)
    }

    /// Decodes a wire payload.
    ///
    /// The kind tag is checked first so that records written by a newer
    /// protocol version surface as [`CodecError::UnknownEntryKind`] rather
    /// than a generic parse failure.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(CodecError::Malformed)?;
        let kind = value
            .get("fn")
            .and_then(serde_json::Value::as_str)
            .ok_or(CodecError::MissingKind)?;
        EntryKind::from_str(kind)?;
        serde_json::from_value(value).map_err(CodecError::Malformed)
    }
}

// ============================================================================
// Log Entry / Record
// ============================================================================

/// An entry together with its position in the log, once it has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(flatten)]
    pub entry: Entry,
    #[serde(
        rename = "message-id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub message_id: Option<MessageId>,
}

impl LogEntry {
    /// An entry that has not been appended yet.
    pub fn pending(entry: Entry) -> Self {
        Self {
            entry,
            message_id: None,
        }
    }

    /// An entry at a known log position.
    pub fn at(message_id: MessageId, entry: Entry) -> Self {
        Self {
            entry,
            message_id: Some(message_id),
        }
    }

    pub fn kind(&self) -> EntryKind {
        self.entry.kind()
    }
}

/// A durable record as delivered by the log to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub message_id: MessageId,
    pub payload: Bytes,
}

impl LogRecord {
    pub fn new(message_id: MessageId, payload: Bytes) -> Self {
        Self {
            message_id,
            payload,
        }
    }

    /// Decodes the payload into a positioned [`LogEntry`].
    pub fn decode(&self) -> Result<LogEntry, CodecError> {
        Entry::decode(&self.payload).map(|entry| LogEntry::at(self.message_id, entry))
    }
}

// ============================================================================
// Reaction
// ============================================================================

/// A candidate entry produced as a consequence of applying another entry.
///
/// Immediate reactions bypass the stall window; everything else waits until
/// the authoring actor is unstalled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub entry: Entry,
    pub immediate: bool,
}

impl Reaction {
    pub fn immediate(entry: Entry) -> Self {
        Self {
            entry,
            immediate: true,
        }
    }

    pub fn deferred(entry: Entry) -> Self {
        Self {
            entry,
            immediate: false,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode entry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed entry payload: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("entry payload has no \"fn\" tag")]
    MissingKind,

    #[error("no state machine registered for entry kind {0:?}")]
    UnknownEntryKind(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(group: &str) -> Entry {
        Entry::PrepareJoinCluster {
            joiner: GroupId::new(group),
        }
    }

    #[test]
    fn wire_shape_uses_fn_and_args() {
        let payload = join("g1").encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["fn"], "prepare-join-cluster");
        assert_eq!(value["args"]["joiner"], "g1");
    }

    #[test]
    fn gc_has_no_args() {
        let payload = Entry::Gc.encode().unwrap();
        assert_eq!(Entry::decode(&payload).unwrap(), Entry::Gc);
    }

    #[test]
    fn record_decode_carries_message_id() {
        let record = LogRecord::new(MessageId::new(7), join("g1").encode().unwrap());
        let entry = record.decode().unwrap();
        assert_eq!(entry.message_id, Some(MessageId::new(7)));
        assert_eq!(entry.kind(), EntryKind::PrepareJoinCluster);
    }

    #[test]
    fn unknown_kind_is_reported_by_name() {
        let payload = br#"{"fn":"rebalance-everything","args":{}}"#;
        match Entry::decode(payload) {
            Err(CodecError::UnknownEntryKind(kind)) => assert_eq!(kind, "rebalance-everything"),
            other => panic!("expected UnknownEntryKind, got {other:?}"),
        }
    }

    #[test]
    fn missing_kind_is_rejected() {
        assert!(matches!(
            Entry::decode(br#"{"args":{}}"#),
            Err(CodecError::MissingKind)
        ));
    }

    #[test]
    fn bad_args_are_malformed() {
        assert!(matches!(
            Entry::decode(br#"{"fn":"kill-job","args":{"wrong":1}}"#),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn every_kind_parses_from_its_wire_name() {
        for kind in EntryKind::ALL {
            assert_eq!(kind.as_str().parse::<EntryKind>().unwrap(), kind);
        }
    }

    #[test]
    fn only_job_entries_are_peerless() {
        let peerless: Vec<_> = EntryKind::ALL
            .into_iter()
            .filter(|kind| kind.is_peerless())
            .collect();
        assert_eq!(
            peerless,
            vec![EntryKind::SubmitJob, EntryKind::KillJob, EntryKind::Gc]
        );
    }

    #[test]
    fn accept_addresses_both_sides_of_the_join() {
        let entry = Entry::AcceptJoinCluster {
            joiner: GroupId::new("g2"),
            watcher: GroupId::new("g1"),
        };
        assert_eq!(
            entry.addressed(),
            vec![
                ActorId::Group(GroupId::new("g2")),
                ActorId::Group(GroupId::new("g1"))
            ]
        );
        assert!(Entry::Gc.addressed().is_empty());
    }

    #[test]
    fn log_entry_serializes_message_id_next_to_kind() {
        let entry = LogEntry::at(MessageId::new(3), Entry::Gc);
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["fn"], "gc");
        assert_eq!(value["message-id"], 3);
    }
}
