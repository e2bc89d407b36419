//! Peer runtime for Jasper.
//!
//! Runs the per-actor loops around the pure kernel:
//! - The processing loop: log subscription → kernel → side effects → outbox
//! - The outbox loop: FIFO, back-pressured appends to the log
//! - The seams the loops are built on: [`Log`], [`Messenger`], [`TaskRunner`]
//! - An [`InMemoryLog`] for tests and single-process clusters

pub mod error;
pub mod log;
pub mod messenger;
mod outbox;
pub mod peer;
pub mod task;

pub use error::{LogError, PeerError, Result};
pub use log::{ChunkWrite, InMemoryLog, Log, Subscription};
pub use messenger::{LocalMessenger, Messenger};
pub use peer::{Member, Peer, PeerHandle, PeerLocalState, PeerStatus};
pub use task::{NoopTaskRunner, RunningTask, TaskEvent, TaskRunner};
