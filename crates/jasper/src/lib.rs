//! # Jasper
//!
//! A replicated cluster-control log for virtual peers.
//!
//! Every peer and group subscribes to one totally ordered log and feeds each
//! entry through the same pure state machine, so they all derive the same
//! replica of cluster membership, job allocation and task progress. The only
//! way to change the cluster is to append an entry.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            Peer                              │
//! │  ┌─────────┐   ┌──────────┐   ┌──────────┐   ┌────────────┐  │
//! │  │   Log   │ → │  Kernel  │ → │  Stall   │ → │   Outbox   │  │
//! │  │(ordered)│   │(pure FSM)│   │ (buffer) │   │  (append)  │  │
//! │  └─────────┘   └──────────┘   └──────────┘   └────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use jasper::{JasperConfig, JobSpec, LocalCluster};
//!
//! # async fn demo() -> jasper::Result<()> {
//! let mut cluster = LocalCluster::new(JasperConfig::default());
//! cluster.add_group("g1").await?;
//! cluster.add_peer("p1", "g1").await?;
//! cluster.wait_until_ready(Duration::from_secs(5)).await?;
//!
//! cluster.submit_job("j1", JobSpec::new(["ingest", "index"])).await?;
//! cluster.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - **Cluster**: [`LocalCluster`] runs a whole cluster over an in-memory log
//! - **Kernel**: [`Replica`], [`step`] and the allocation, reaction and side
//!   effect rules
//! - **Peer**: [`Peer`], [`PeerHandle`] and the [`Log`], [`Messenger`] and
//!   [`TaskRunner`] seams

mod cluster;
mod error;

pub use cluster::LocalCluster;
pub use error::{JasperError, Result};

// Re-export core types
pub use jasper_types::{
    ActorId, ChunkKey, ClusterChunk, Entry, EntryKind, GroupId, JobId, JobScheduler, JobSpec,
    LogEntry, LogRecord, MessageId, MessagingConfig, PeerId, PeerSite, Reaction, TaskId,
    Transport,
};

// Re-export the state machine
pub use jasper_kernel::{
    Allocations, Change, Diff, Replica, SideEffect, Slot, StallBuffer, step,
};

// Re-export the peer runtime
pub use jasper_peer::{
    InMemoryLog, LocalMessenger, Log, LogError, Member, Messenger, NoopTaskRunner, Peer,
    PeerError, PeerHandle, PeerStatus, RunningTask, TaskEvent, TaskRunner,
};

// Re-export configuration
pub use jasper_config::{ConfigLoader, JasperConfig};
