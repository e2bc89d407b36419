//! The outbox loop: persists a peer's locally generated entries in FIFO
//! order.
//!
//! The queue is bounded, so a peer producing reactions faster than the log
//! accepts them waits on `send`. On kill, entries still queued are
//! abandoned; an append already dequeued runs to completion first.

use std::sync::Arc;

use jasper_types::{ActorId, Entry};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::log::Log;

pub(crate) fn spawn_outbox<L: Log>(
    actor: ActorId,
    log: Arc<L>,
    queue: mpsc::Receiver<Entry>,
    kill: watch::Receiver<bool>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let result = run_outbox(&actor, log.as_ref(), queue, kill).await;
        if let Err(err) = &result {
            tracing::error!(actor = %actor, error = %err, "outbox loop failed");
        }
        result
    })
}

/// Resolves once the kill signal is raised or its sender is gone.
pub(crate) async fn killed(kill: &mut watch::Receiver<bool>) {
    let _ = kill.wait_for(|killed| *killed).await;
}

async fn run_outbox<L: Log>(
    actor: &ActorId,
    log: &L,
    mut queue: mpsc::Receiver<Entry>,
    mut kill: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let entry = tokio::select! {
            biased;

            () = killed(&mut kill) => {
                tracing::debug!(actor = %actor, abandoned = queue.len(), "outbox killed");
                break;
            }
            next = queue.recv() => match next {
                Some(entry) => entry,
                None => {
                    tracing::debug!(actor = %actor, "outbox queue closed");
                    break;
                }
            },
        };

        let kind = entry.kind();
        let message_id = log.append(&entry).await?;
        tracing::trace!(actor = %actor, %kind, %message_id, "appended entry");
    }
    Ok(())
}
