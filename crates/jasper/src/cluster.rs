//! A whole cluster in one process.
//!
//! `LocalCluster` owns an [`InMemoryLog`] and the handles of every peer and
//! group it started. All coordination still goes through the log; the
//! cluster only starts actors, writes client entries and waits for the
//! replicas to agree.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jasper_config::JasperConfig;
use jasper_kernel::Replica;
use jasper_peer::{
    InMemoryLog, LocalMessenger, Log, Member, NoopTaskRunner, Peer, PeerHandle, TaskRunner,
};
use jasper_types::{ActorId, Entry, GroupId, JobId, JobSpec, MessageId, PeerId};

use crate::error::{JasperError, Result};

/// Groups and virtual peers sharing one in-memory log.
pub struct LocalCluster<R = NoopTaskRunner> {
    config: JasperConfig,
    log: Arc<InMemoryLog>,
    runner: Arc<R>,
    messenger: LocalMessenger,
    actors: BTreeMap<ActorId, PeerHandle>,
}

impl LocalCluster<NoopTaskRunner> {
    /// A cluster whose tasks do nothing.
    pub fn new(config: JasperConfig) -> Self {
        Self::with_runner(config, Arc::new(NoopTaskRunner::new()))
    }
}

impl<R: TaskRunner> LocalCluster<R> {
    pub fn with_runner(config: JasperConfig, runner: Arc<R>) -> Self {
        let messenger = LocalMessenger::new(config.cluster.messaging.clone());
        Self {
            config,
            log: Arc::new(InMemoryLog::new()),
            runner,
            messenger,
            actors: BTreeMap::new(),
        }
    }

    pub fn log(&self) -> &Arc<InMemoryLog> {
        &self.log
    }

    pub fn runner(&self) -> &Arc<R> {
        &self.runner
    }

    /// Every actor started and not yet stopped.
    pub fn actors(&self) -> impl Iterator<Item = &ActorId> {
        self.actors.keys()
    }

    pub fn handle(&self, actor: &ActorId) -> Option<&PeerHandle> {
        self.actors.get(actor)
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    /// Starts a group, which asks to join as soon as it is running.
    pub async fn add_group(&mut self, group: impl Into<GroupId>) -> Result<&PeerHandle> {
        self.start(Member::Group(group.into())).await
    }

    /// Starts a virtual peer hosted by `group`. It asks to be added once the
    /// group has joined.
    pub async fn add_peer(
        &mut self,
        peer: impl Into<PeerId>,
        group: impl Into<GroupId>,
    ) -> Result<&PeerHandle> {
        self.start(Member::Peer {
            id: peer.into(),
            group: group.into(),
        })
        .await
    }

    async fn start(&mut self, member: Member) -> Result<&PeerHandle> {
        let actor = member.actor_id();
        if self.actors.contains_key(&actor) {
            return Err(JasperError::DuplicateActor(actor));
        }
        let handle = Peer::new(member, Arc::clone(&self.log), Arc::clone(&self.runner))
            .with_config(self.config.clone())
            .with_messenger(&self.messenger)
            .start()
            .await?;
        tracing::info!(actor = %actor, "started actor");
        Ok(self.actors.entry(actor).or_insert(handle))
    }

    /// Stops one actor and forgets it. Its membership stays in the log.
    pub async fn stop(&mut self, actor: &ActorId) -> Result<()> {
        let mut handle = self
            .actors
            .remove(actor)
            .ok_or_else(|| JasperError::UnknownActor(actor.clone()))?;
        handle.stop().await?;
        Ok(())
    }

    /// Stops every actor, reporting the first failure after trying all.
    pub async fn shutdown(self) -> Result<()> {
        let mut first_error = None;
        for (actor, mut handle) in self.actors {
            if let Err(err) = handle.stop().await {
                tracing::error!(actor = %actor, error = %err, "failed to stop actor");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Client entries
    // ------------------------------------------------------------------------

    /// Appends an entry on behalf of a client outside the cluster.
    pub async fn append(&self, entry: &Entry) -> Result<MessageId> {
        let message_id = self.log.append(entry).await?;
        tracing::debug!(kind = %entry.kind(), %message_id, "client appended entry");
        Ok(message_id)
    }

    pub async fn submit_job(&self, job: impl Into<JobId>, spec: JobSpec) -> Result<MessageId> {
        self.append(&Entry::SubmitJob {
            job: job.into(),
            spec,
        })
        .await
    }

    pub async fn kill_job(&self, job: impl Into<JobId>) -> Result<MessageId> {
        self.append(&Entry::KillJob { job: job.into() }).await
    }

    pub async fn gc(&self) -> Result<MessageId> {
        self.append(&Entry::Gc).await
    }

    // ------------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------------

    /// Waits until every running actor's replica satisfies `predicate`.
    pub async fn wait_until(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&Replica) -> bool,
    ) -> Result<()> {
        let all = async {
            for handle in self.actors.values() {
                handle.wait_for_replica(&mut predicate).await?;
            }
            Ok::<(), JasperError>(())
        };
        tokio::time::timeout(timeout, all)
            .await
            .map_err(|_| JasperError::Timeout(timeout))?
    }

    /// Waits until every running actor sees every running actor as ready.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let actors: Vec<ActorId> = self.actors.keys().cloned().collect();
        self.wait_until(timeout, |replica| {
            actors.iter().all(|actor| replica.is_ready(actor))
        })
        .await
    }

    /// Waits until every running actor has applied the whole log and
    /// returns the replica they agree on.
    ///
    /// Fails with [`JasperError::Diverged`] if two actors that applied the
    /// same prefix hold different replicas.
    pub async fn settle(&self, timeout: Duration) -> Result<Arc<Replica>> {
        tokio::time::timeout(timeout, self.agree())
            .await
            .map_err(|_| JasperError::Timeout(timeout))?
    }

    async fn agree(&self) -> Result<Arc<Replica>> {
        loop {
            let last = self.log.len().checked_sub(1).map(|n| MessageId::new(n as u64));
            for handle in self.actors.values() {
                handle
                    .wait_for_replica(|replica| replica.last_applied() >= last)
                    .await?;
            }

            let replicas: Vec<(&ActorId, Arc<Replica>)> = self
                .actors
                .iter()
                .map(|(actor, handle)| (actor, handle.replica()))
                .collect();
            let Some((_, first)) = replicas.first() else {
                return Ok(Arc::new(Replica::new()));
            };
            // Reactions may have grown the log while we waited.
            let current = self.log.len().checked_sub(1).map(|n| MessageId::new(n as u64));
            if replicas
                .iter()
                .any(|(_, replica)| replica.last_applied() != current)
            {
                tokio::task::yield_now().await;
                continue;
            }

            let expected = first.state_hash();
            if let Some((actor, _)) = replicas
                .iter()
                .find(|(_, replica)| replica.state_hash() != expected)
            {
                tracing::error!(actor = %actor, "replica diverged");
                return Err(JasperError::Diverged {
                    actor: (*actor).clone(),
                    at: current,
                });
            }
            return Ok(Arc::clone(first));
        }
    }
}

impl<R> std::fmt::Debug for LocalCluster<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("actors", &self.actors.keys().collect::<Vec<_>>())
            .field("log_len", &self.log.len())
            .finish_non_exhaustive()
    }
}
