//! The log seam and an in-memory implementation.
//!
//! The log is the only channel of coordination between peers: it totally
//! orders appended entries, assigns their message ids, and replays them to
//! every subscriber from the beginning.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use jasper_kernel::Replica;
use jasper_types::{ActorId, ChunkKey, ClusterChunk, Entry, LogRecord, MessageId};
use tokio::sync::mpsc;

use crate::error::LogError;

/// Outcome of a first-writer-wins chunk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWrite {
    Written,
    AlreadyPresent,
}

/// A subscription to the log from its first entry.
#[derive(Debug)]
pub struct Subscription {
    /// Replica built from the cluster-wide chunks, before any entry.
    pub origin: Replica,
    /// Every record in log order, existing ones first. Closes with the log.
    pub records: mpsc::UnboundedReceiver<LogRecord>,
}

/// An ordered, append-only, durable log with subscribe-from-start semantics.
pub trait Log: Send + Sync + 'static {
    /// Records that an actor is alive.
    fn register_presence(
        &self,
        actor: &ActorId,
    ) -> impl Future<Output = Result<(), LogError>> + Send;

    /// Writes a cluster-wide chunk unless one already exists for its key.
    fn write_chunk(
        &self,
        chunk: ClusterChunk,
    ) -> impl Future<Output = Result<ChunkWrite, LogError>> + Send;

    /// Subscribes to every entry from the start of the log.
    fn subscribe_from_start(
        &self,
        actor: &ActorId,
    ) -> impl Future<Output = Result<Subscription, LogError>> + Send;

    /// Durably appends an entry and returns its assigned message id.
    fn append(&self, entry: &Entry) -> impl Future<Output = Result<MessageId, LogError>> + Send;
}

// ============================================================================
// In-memory log
// ============================================================================

#[derive(Debug, Default)]
struct Inner {
    records: Vec<LogRecord>,
    subscribers: Vec<mpsc::UnboundedSender<LogRecord>>,
    chunks: BTreeMap<ChunkKey, ClusterChunk>,
    presence: BTreeSet<ActorId>,
    closed: bool,
}

impl Inner {
    fn push(&mut self, payload: Bytes) -> Result<MessageId, LogError> {
        if self.closed {
            return Err(LogError::Closed);
        }
        let id = MessageId::new(self.records.len() as u64);
        let record = LogRecord::new(id, payload);
        self.subscribers
            .retain(|subscriber| subscriber.send(record.clone()).is_ok());
        self.records.push(record);
        Ok(id)
    }
}

/// A log held in process memory, shared by cloning.
///
/// Appends are serialized by a mutex, so message ids are dense and every
/// subscriber observes the same order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLog {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, LogError> {
        self.inner.lock().map_err(|_| LogError::Poisoned)
    }

    /// Appends a raw payload, bypassing entry encoding.
    pub fn append_raw(&self, payload: impl Into<Bytes>) -> Result<MessageId, LogError> {
        self.lock()?.push(payload.into())
    }

    /// Every record appended so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.lock().map(|inner| inner.records.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.records.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Actors that registered presence.
    pub fn present(&self) -> BTreeSet<ActorId> {
        self.lock()
            .map(|inner| inner.presence.clone())
            .unwrap_or_default()
    }

    /// Closes the log: appends fail and every subscription ends.
    pub fn close(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.closed = true;
            inner.subscribers.clear();
        }
    }
}

impl Log for InMemoryLog {
    async fn register_presence(&self, actor: &ActorId) -> Result<(), LogError> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(LogError::Closed);
        }
        inner.presence.insert(actor.clone());
        Ok(())
    }

    async fn write_chunk(&self, chunk: ClusterChunk) -> Result<ChunkWrite, LogError> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(LogError::Closed);
        }
        match inner.chunks.entry(chunk.key()) {
            std::collections::btree_map::Entry::Occupied(_) => Ok(ChunkWrite::AlreadyPresent),
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(chunk);
                Ok(ChunkWrite::Written)
            }
        }
    }

    async fn subscribe_from_start(&self, _actor: &ActorId) -> Result<Subscription, LogError> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(LogError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        // Replay and registration happen under one lock so no record is
        // missed or delivered twice.
        for record in &inner.records {
            if tx.send(record.clone()).is_err() {
                break;
            }
        }
        inner.subscribers.push(tx);
        let origin = Replica::origin(inner.chunks.values().cloned());
        Ok(Subscription {
            origin,
            records: rx,
        })
    }

    async fn append(&self, entry: &Entry) -> Result<MessageId, LogError> {
        let payload = entry.encode()?;
        self.lock()?.push(payload)
    }
}
