//! The task execution seam.
//!
//! A peer starts a task when the replica allocates it one and stops it when
//! the allocation moves away, the job ends, or the peer stops.

use std::sync::{Arc, Mutex};

use jasper_kernel::Slot;
use jasper_types::PeerId;

use crate::error::{PeerError, Result};

/// A task that is executing on a peer.
pub trait RunningTask: Send {
    fn slot(&self) -> &Slot;

    fn is_active(&self) -> bool;

    /// Stops the task. Stopping twice is a no-op.
    fn stop(&mut self);
}

/// Starts tasks for a peer.
pub trait TaskRunner: Send + Sync + 'static {
    fn start(&self, peer: &PeerId, slot: &Slot) -> Result<Box<dyn RunningTask>>;
}

/// A start or stop observed by [`NoopTaskRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Started { peer: PeerId, slot: Slot },
    Stopped { peer: PeerId, slot: Slot },
}

/// Task runner that executes nothing and records what it was asked to do.
#[derive(Debug, Clone, Default)]
pub struct NoopTaskRunner {
    events: Arc<Mutex<Vec<TaskEvent>>>,
}

impl NoopTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every start and stop so far, in order.
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl TaskRunner for NoopTaskRunner {
    fn start(&self, peer: &PeerId, slot: &Slot) -> Result<Box<dyn RunningTask>> {
        self.events
            .lock()
            .map_err(|_| PeerError::TaskRunner {
                peer: peer.clone(),
                reason: "event log poisoned".to_string(),
            })?
            .push(TaskEvent::Started {
                peer: peer.clone(),
                slot: slot.clone(),
            });
        Ok(Box::new(NoopTask {
            peer: peer.clone(),
            slot: slot.clone(),
            active: true,
            events: Arc::clone(&self.events),
        }))
    }
}

struct NoopTask {
    peer: PeerId,
    slot: Slot,
    active: bool,
    events: Arc<Mutex<Vec<TaskEvent>>>,
}

impl RunningTask for NoopTask {
    fn slot(&self) -> &Slot {
        &self.slot
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Ok(mut events) = self.events.lock() {
            events.push(TaskEvent::Stopped {
                peer: self.peer.clone(),
                slot: self.slot.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use jasper_types::{JobId, TaskId};

    use super::*;

    #[test]
    fn noop_runner_records_start_and_single_stop() {
        let runner = NoopTaskRunner::new();
        let peer = PeerId::new("p1");
        let slot = Slot::new(JobId::new("j1"), TaskId::new("t"));

        let mut task = runner.start(&peer, &slot).unwrap();
        assert!(task.is_active());
        task.stop();
        task.stop();
        assert!(!task.is_active());

        assert_eq!(
            runner.events(),
            vec![
                TaskEvent::Started {
                    peer: peer.clone(),
                    slot: slot.clone()
                },
                TaskEvent::Stopped { peer, slot },
            ]
        );
    }
}
