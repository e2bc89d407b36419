//! Output policy for reactions while an actor is stalled.
//!
//! Every actor starts stalled. Immediate reactions always go out at once;
//! deferred reactions are held in arrival order until the actor is unstalled,
//! then released together, each exactly once.

use jasper_types::{Entry, Reaction};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallBuffer {
    stalled: bool,
    buffered: Vec<Entry>,
}

impl Default for StallBuffer {
    fn default() -> Self {
        Self::stalled()
    }
}

impl StallBuffer {
    /// A buffer in the initial, stalled state.
    pub fn stalled() -> Self {
        Self {
            stalled: true,
            buffered: Vec::new(),
        }
    }

    pub fn unstalled() -> Self {
        Self {
            stalled: false,
            buffered: Vec::new(),
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Entries held back, oldest first.
    pub fn buffered(&self) -> &[Entry] {
        &self.buffered
    }

    /// Routes reactions, returning the entries to send now in order.
    pub fn route(&mut self, reactions: Vec<Reaction>) -> Vec<Entry> {
        let mut send = Vec::with_capacity(reactions.len());
        for reaction in reactions {
            if self.stalled && !reaction.immediate {
                self.buffered.push(reaction.entry);
            } else {
                send.push(reaction.entry);
            }
        }
        send
    }

    /// Unstalls and returns the buffered entries as one ordered batch.
    ///
    /// Idempotent: a second call returns nothing.
    pub fn unstall(&mut self) -> Vec<Entry> {
        self.stalled = false;
        std::mem::take(&mut self.buffered)
    }
}
