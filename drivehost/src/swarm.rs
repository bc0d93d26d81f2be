//! Swarm participation of loaded archives.
//!
//! A single [`SwarmActor`] owns all swarm state: which discovery topics are joined with
//! which [`SwarmOpts`], and every replication stream. It is driven through the cloneable
//! [`SwarmHandle`].
//!
//! Each replication stream moves through
//! `Connecting -> HandshakePending -> Active -> Closed`. A connection is `Connecting`
//! while it waits in the connection channel. Once the actor picks it up it becomes a
//! stream in [`StreamState::HandshakePending`] with a [`HANDSHAKE_TIMEOUT`]; either the
//! handshake completes (`Active`) or the timeout fires and the stream is destroyed. Closed
//! streams are removed from their archive.

use std::{collections::HashMap, future::Future, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    task::{AbortHandle, JoinSet},
};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, error_span, trace, warn, Instrument};

use crate::{
    archive::ArchiveHandle,
    key::{ArchiveKey, DiscoveryKey},
    storage::{ArchiveStorage, BoxedIo, ReplicateOpts, ReplicationStream},
};

/// Streams that have not completed their handshake after this long are destroyed.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the channel for the [`ToSwarmActor`] messages.
const ACTOR_CHANNEL_CAP: usize = 64;
/// Capacity of the channel for incoming connections.
const CONNECTION_CHANNEL_CAP: usize = 64;

/// Desired swarm participation of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwarmOpts {
    /// Announce the archive and serve it to peers.
    pub upload: bool,
    /// Fetch data of the archive from peers.
    pub download: bool,
}

impl SwarmOpts {
    /// Upload and download.
    pub const FULL: Self = Self {
        upload: true,
        download: true,
    };

    /// Not in the swarm at all.
    pub const OFF: Self = Self {
        upload: false,
        download: false,
    };

    /// Whether these options mean not swarming.
    pub fn is_off(&self) -> bool {
        !self.upload && !self.download
    }

    /// The value stored on an archive for these options: `None` when not swarming.
    fn normalize(self) -> Option<Self> {
        (!self.is_off()).then_some(self)
    }
}

impl Default for SwarmOpts {
    fn default() -> Self {
        Self::FULL
    }
}

/// Options when joining a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOpts {
    /// Announce ourselves as a provider of the topic, and accept inbound connections for it.
    pub announce: bool,
}

/// Who opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Direction {
    /// The peer connected to us.
    Inbound,
    /// We connected to the peer.
    Outbound,
}

/// A new connection to a peer for a topic.
#[derive(derive_more::Debug)]
pub struct Connection {
    /// The topic the connection was made for.
    pub topic: DiscoveryKey,
    /// Who opened the connection.
    pub direction: Direction,
    /// The connection.
    #[debug("BoxedIo")]
    pub io: BoxedIo,
}

/// Where a [`Discovery`] delivers connections for a joined topic.
pub type ConnectionSender = mpsc::Sender<Connection>;

/// Discovery and transport of the swarm.
pub trait Discovery: Send + Sync + 'static {
    /// Join the swarm for `topic`, delivering every connection for it to `connections`.
    fn join(
        &self,
        topic: DiscoveryKey,
        opts: JoinOpts,
        connections: ConnectionSender,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Leave the swarm for `topic`, no further connections are made or accepted for it.
    fn leave(&self, topic: DiscoveryKey) -> impl Future<Output = Result<()>> + Send;
}

/// Lifecycle state of a replication stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum StreamState {
    /// Waiting for the handshake, bounded by [`HANDSHAKE_TIMEOUT`].
    HandshakePending,
    /// Handshake completed; the peer counts towards the archive's peers.
    Active,
}

/// Information about a replication stream of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// Identifier, unique for the lifetime of the swarm actor.
    pub id: StreamId,
    /// Who opened the connection.
    pub direction: Direction,
    /// Current state.
    pub state: StreamState,
}

/// Identifier of a replication stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("#{_0}")]
pub struct StreamId(u64);

/// Messages to the swarm actor.
#[derive(derive_more::Debug, strum::Display)]
enum ToSwarmActor<A> {
    ApplyPolicy {
        archive: ArchiveHandle<A>,
        opts: SwarmOpts,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<Result<()>>,
    },
    Forget {
        key: ArchiveKey,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
    Streams {
        key: ArchiveKey,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<Vec<StreamInfo>>,
    },
    Shutdown {
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
}

/// Events reported by running streams.
#[derive(Debug)]
enum StreamEvent {
    Handshake { topic: DiscoveryKey, id: StreamId },
}

/// How a stream task ended.
#[derive(Debug)]
enum StreamEnd {
    TimedOut,
    HandshakeFailed(anyhow::Error),
    Closed(Result<()>),
}

/// Handle to the swarm actor.
#[derive(derive_more::Debug)]
pub struct SwarmHandle<A> {
    to_actor: mpsc::Sender<ToSwarmActor<A>>,
    connections: ConnectionSender,
    #[debug("AbortOnDropHandle")]
    _actor_handle: std::sync::Arc<AbortOnDropHandle<()>>,
}

impl<A> Clone for SwarmHandle<A> {
    fn clone(&self) -> Self {
        Self {
            to_actor: self.to_actor.clone(),
            connections: self.connections.clone(),
            _actor_handle: self._actor_handle.clone(),
        }
    }
}

impl<A: ArchiveStorage> SwarmHandle<A> {
    /// Spawn the swarm actor on the current tokio runtime.
    pub fn spawn<D: Discovery>(discovery: D) -> Self {
        let (to_actor, inbox) = mpsc::channel(ACTOR_CHANNEL_CAP);
        let (connections, connections_rx) = mpsc::channel(CONNECTION_CHANNEL_CAP);
        let (stream_events_tx, stream_events_rx) = mpsc::unbounded_channel();
        let actor = SwarmActor {
            inbox,
            discovery,
            connections: connections.clone(),
            connections_rx,
            stream_events_tx,
            stream_events_rx,
            archives: Default::default(),
            stream_tasks: Default::default(),
            next_stream_id: 0,
        };
        let handle = tokio::task::spawn(
            async move {
                if let Err(err) = actor.run().await {
                    error!("swarm actor failed: {err:?}");
                }
            }
            .instrument(error_span!("swarm")),
        );
        Self {
            to_actor,
            connections,
            _actor_handle: std::sync::Arc::new(AbortOnDropHandle::new(handle)),
        }
    }

    /// Apply a swarm policy to an archive.
    ///
    /// Does nothing if the archive is already swarming with these options. Otherwise all
    /// replication streams of the archive are destroyed, the current swarm membership is
    /// left and, unless both flags are false, the swarm is joined again with the new
    /// options.
    ///
    /// A [closed](ArchiveHandle::is_closed) archive is only ever torn down, any other
    /// policy is ignored for it.
    pub async fn apply_policy(&self, archive: ArchiveHandle<A>, opts: SwarmOpts) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(ToSwarmActor::ApplyPolicy {
            archive,
            opts,
            reply,
        })
        .await?;
        reply_rx.await.context("swarm actor dropped reply")?
    }

    /// Drop all swarm state of an archive.
    ///
    /// This does not leave the swarm, apply [`SwarmOpts::OFF`] first.
    pub async fn forget(&self, key: ArchiveKey) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(ToSwarmActor::Forget { key, reply }).await?;
        reply_rx.await.context("swarm actor dropped reply")?;
        Ok(())
    }

    /// Replication streams of an archive.
    pub async fn streams(&self, key: ArchiveKey) -> Result<Vec<StreamInfo>> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(ToSwarmActor::Streams { key, reply }).await?;
        let streams = reply_rx.await.context("swarm actor dropped reply")?;
        Ok(streams)
    }

    /// Hand a connection to the swarm, as if the transport had delivered it.
    pub async fn handle_connection(&self, conn: Connection) -> Result<()> {
        self.connections
            .send(conn)
            .await
            .map_err(|_| anyhow!("swarm actor closed"))
    }

    /// Destroy all streams, leave all swarms and stop the actor.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(ToSwarmActor::Shutdown { reply }).await?;
        reply_rx.await.context("swarm actor dropped reply")?;
        Ok(())
    }

    async fn send(&self, msg: ToSwarmActor<A>) -> Result<()> {
        self.to_actor
            .send(msg)
            .await
            .map_err(|_| anyhow!("swarm actor closed"))
    }
}

/// Swarm state of one archive.
struct ArchiveSwarm<A> {
    archive: ArchiveHandle<A>,
    joined: bool,
    streams: Vec<StreamEntry>,
}

impl<A> ArchiveSwarm<A> {
    fn new(archive: ArchiveHandle<A>) -> Self {
        Self {
            archive,
            joined: false,
            streams: Vec::new(),
        }
    }

    /// Recompute the peer count from the streams: ourselves plus every active stream.
    fn update_num_peers(&self) {
        let active = self
            .streams
            .iter()
            .filter(|s| s.state == StreamState::Active)
            .count();
        self.archive.set_num_peers(1 + active);
    }
}

struct StreamEntry {
    id: StreamId,
    direction: Direction,
    state: StreamState,
    abort: AbortHandle,
}

/// The actor owning all swarm state.
struct SwarmActor<A, D> {
    inbox: mpsc::Receiver<ToSwarmActor<A>>,
    discovery: D,
    /// Cloned into every join, so the transport can deliver connections.
    connections: ConnectionSender,
    connections_rx: mpsc::Receiver<Connection>,
    /// Only cloned into stream tasks.
    stream_events_tx: mpsc::UnboundedSender<StreamEvent>,
    stream_events_rx: mpsc::UnboundedReceiver<StreamEvent>,
    archives: HashMap<DiscoveryKey, ArchiveSwarm<A>>,
    stream_tasks: JoinSet<(DiscoveryKey, StreamId, StreamEnd)>,
    next_stream_id: u64,
}

impl<A: ArchiveStorage, D: Discovery> SwarmActor<A, D> {
    async fn run(mut self) -> Result<()> {
        let reply = self.run_inner().await;
        self.shutdown().await;
        match reply {
            Ok(reply) => {
                reply.send(()).ok();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn run_inner(&mut self) -> Result<oneshot::Sender<()>> {
        let mut i = 0;
        loop {
            i += 1;
            trace!(?i, "tick wait");
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    let msg = msg.context("to_actor closed")?;
                    trace!(?i, %msg, "tick: to_actor");
                    match msg {
                        ToSwarmActor::Shutdown { reply } => break Ok(reply),
                        msg => self.on_actor_message(msg).await,
                    }
                }
                Some(event) = self.stream_events_rx.recv() => {
                    trace!(?i, "tick: stream_event");
                    self.on_stream_event(event);
                }
                Some(conn) = self.connections_rx.recv() => {
                    trace!(?i, "tick: connection");
                    self.on_connection(conn);
                }
                Some(res) = self.stream_tasks.join_next_with_id(), if !self.stream_tasks.is_empty() => {
                    trace!(?i, "tick: stream_task");
                    match res {
                        Ok((_task_id, (topic, id, end))) => self.on_stream_closed(topic, id, end),
                        Err(err) if err.is_cancelled() => {
                            // streams are aborted only after being removed
                        }
                        Err(err) => {
                            error!(?err, "stream task panicked");
                            self.remove_stream_by_task(err.id());
                        }
                    }
                }
            }
        }
    }

    async fn on_actor_message(&mut self, msg: ToSwarmActor<A>) {
        match msg {
            ToSwarmActor::Shutdown { .. } => unreachable!("handled in run_inner"),
            ToSwarmActor::ApplyPolicy {
                archive,
                opts,
                reply,
            } => {
                let key = archive.key();
                let res = self
                    .apply_policy(archive, opts)
                    .instrument(error_span!("policy", key = %key.fmt_short()))
                    .await;
                reply.send(res).ok();
            }
            ToSwarmActor::Forget { key, reply } => {
                let topic = key.discovery_key();
                if self.archives.contains_key(&topic) {
                    self.teardown(topic).await;
                    self.archives.remove(&topic);
                }
                reply.send(()).ok();
            }
            ToSwarmActor::Streams { key, reply } => {
                let streams = self
                    .archives
                    .get(&key.discovery_key())
                    .map(|swarm| {
                        swarm
                            .streams
                            .iter()
                            .map(|s| StreamInfo {
                                id: s.id,
                                direction: s.direction,
                                state: s.state,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                reply.send(streams).ok();
            }
        }
    }

    async fn apply_policy(&mut self, archive: ArchiveHandle<A>, opts: SwarmOpts) -> Result<()> {
        let desired = opts.normalize();
        let topic = archive.discovery_key();
        let tracked = self
            .archives
            .get(&topic)
            .map(|swarm| swarm.archive.ptr_eq(&archive));

        if archive.is_closed() {
            // only ever leave: never track or join for a closed archive
            if desired.is_some() {
                debug!("ignoring swarm policy for closed archive");
            }
            if tracked == Some(true) {
                self.teardown(topic).await;
            }
            return Ok(());
        }

        if tracked == Some(false) {
            // the archive was closed and loaded again without being forgotten
            debug!("replacing stale swarm state");
            self.teardown(topic).await;
            self.archives.remove(&topic);
        }

        let swarm = self
            .archives
            .entry(topic)
            .or_insert_with(|| ArchiveSwarm::new(archive.clone()));
        if swarm.archive.swarm_opts() == desired {
            trace!(?desired, "swarm policy unchanged");
            return Ok(());
        }
        debug!(from = ?swarm.archive.swarm_opts(), to = ?desired, "applying swarm policy");

        self.teardown(topic).await;

        let Some(opts) = desired else {
            return Ok(());
        };
        let join_opts = JoinOpts {
            announce: opts.upload,
        };
        self.discovery
            .join(topic, join_opts, self.connections.clone())
            .await
            .context("failed to join swarm")?;
        if let Some(swarm) = self.archives.get_mut(&topic) {
            swarm.joined = true;
            swarm.archive.set_swarm_opts(Some(opts));
        }
        Ok(())
    }

    /// Destroy all streams of an archive and leave its swarm.
    async fn teardown(&mut self, topic: DiscoveryKey) {
        let Some(swarm) = self.archives.get_mut(&topic) else {
            return;
        };
        for stream in swarm.streams.drain(..) {
            trace!(id = %stream.id, "destroying stream");
            stream.abort.abort();
        }
        let was_joined = std::mem::replace(&mut swarm.joined, false);
        swarm.archive.set_swarm_opts(None);
        swarm.update_num_peers();
        if was_joined {
            if let Err(err) = self.discovery.leave(topic).await {
                warn!(topic = %topic.fmt_short(), ?err, "failed to leave swarm");
            }
        }
    }

    fn on_connection(&mut self, conn: Connection) {
        let Connection {
            topic,
            direction,
            io,
        } = conn;
        let Some(swarm) = self.archives.get_mut(&topic) else {
            debug!(topic = %topic.fmt_short(), %direction, "dropping connection for unknown topic");
            return;
        };
        let Some(opts) = swarm.archive.swarm_opts() else {
            debug!(topic = %topic.fmt_short(), %direction, "dropping connection, not swarming");
            return;
        };
        if swarm.archive.is_closed() {
            debug!(topic = %topic.fmt_short(), %direction, "dropping connection, archive closed");
            return;
        }
        let id = StreamId(self.next_stream_id);
        self.next_stream_id += 1;

        let stream = swarm.archive.storage().replicate(
            io,
            ReplicateOpts {
                upload: opts.upload,
                download: opts.download,
                live: true,
            },
        );
        let events = self.stream_events_tx.clone();
        let span = error_span!("stream", key = %swarm.archive.key().fmt_short(), %id, %direction);
        let fut = async move {
            let end = run_stream(stream, topic, id, events).await;
            (topic, id, end)
        }
        .instrument(span);
        let abort = self.stream_tasks.spawn(fut);
        debug!(key = %swarm.archive.key().fmt_short(), %id, %direction, "new replication stream");
        swarm.streams.push(StreamEntry {
            id,
            direction,
            state: StreamState::HandshakePending,
            abort,
        });
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Handshake { topic, id } => {
                let Some(swarm) = self.archives.get_mut(&topic) else {
                    return;
                };
                let Some(stream) = swarm.streams.iter_mut().find(|s| s.id == id) else {
                    return;
                };
                stream.state = StreamState::Active;
                swarm.update_num_peers();
                debug!(key = %swarm.archive.key().fmt_short(), %id, peers = swarm.archive.num_peers(), "peer connected");
            }
        }
    }

    fn on_stream_closed(&mut self, topic: DiscoveryKey, id: StreamId, end: StreamEnd) {
        match &end {
            StreamEnd::TimedOut => debug!(%id, "handshake timed out"),
            StreamEnd::HandshakeFailed(err) => debug!(%id, "handshake failed: {err:#}"),
            StreamEnd::Closed(Ok(())) => debug!(%id, "stream closed"),
            StreamEnd::Closed(Err(err)) => debug!(%id, "stream closed with error: {err:#}"),
        }
        let Some(swarm) = self.archives.get_mut(&topic) else {
            return;
        };
        swarm.streams.retain(|s| s.id != id);
        swarm.update_num_peers();
    }

    fn remove_stream_by_task(&mut self, task_id: tokio::task::Id) {
        for swarm in self.archives.values_mut() {
            let before = swarm.streams.len();
            swarm.streams.retain(|s| s.abort.id() != task_id);
            if swarm.streams.len() != before {
                swarm.update_num_peers();
                return;
            }
        }
    }

    async fn shutdown(&mut self) {
        let topics: Vec<_> = self.archives.keys().copied().collect();
        for topic in topics {
            self.teardown(topic).await;
        }
        self.archives.clear();
        // wait for the aborted streams to wind down
        self.stream_tasks.shutdown().await;
    }
}

/// Drive one replication stream through its lifecycle.
async fn run_stream<S: ReplicationStream>(
    mut stream: S,
    topic: DiscoveryKey,
    id: StreamId,
    events: mpsc::UnboundedSender<StreamEvent>,
) -> StreamEnd {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.handshake()).await {
        Err(_elapsed) => return StreamEnd::TimedOut,
        Ok(Err(err)) => return StreamEnd::HandshakeFailed(err),
        Ok(Ok(())) => {}
    }
    events.send(StreamEvent::Handshake { topic, id }).ok();
    StreamEnd::Closed(stream.run().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{archive, connect, remote_stream, wait_for, TestDiscovery};

    #[tokio::test]
    async fn test_apply_policy_idempotent() -> Result<()> {
        let dir = testdir::testdir!();
        let discovery = TestDiscovery::default();
        let swarm = SwarmHandle::spawn(discovery.clone());
        let handle = archive(dir.clone(), ArchiveKey::generate()).await?;

        swarm.apply_policy(handle.clone(), SwarmOpts::FULL).await?;
        assert_eq!(handle.swarm_opts(), Some(SwarmOpts::FULL));
        assert_eq!(discovery.joins(), 1);
        assert_eq!(discovery.leaves(), 0);

        // an established stream must survive re-applying the same policy
        let (conn, io) = connect(handle.discovery_key());
        swarm.handle_connection(conn).await?;
        let mut remote = remote_stream(dir.clone(), handle.key(), io).await?;
        remote.handshake().await?;
        wait_for(|| handle.num_peers() == 2).await;

        swarm.apply_policy(handle.clone(), SwarmOpts::FULL).await?;
        assert_eq!(discovery.joins(), 1);
        assert_eq!(discovery.leaves(), 0);
        assert_eq!(handle.num_peers(), 2);
        assert_eq!(swarm.streams(handle.key()).await?.len(), 1);

        // a change tears down and rejoins
        let capped = SwarmOpts {
            upload: true,
            download: false,
        };
        swarm.apply_policy(handle.clone(), capped).await?;
        assert_eq!(discovery.joins(), 2);
        assert_eq!(discovery.leaves(), 1);
        assert_eq!(handle.swarm_opts(), Some(capped));
        assert_eq!(handle.num_peers(), 1);
        assert!(swarm.streams(handle.key()).await?.is_empty());
        assert_eq!(
            discovery.joined.lock().get(&handle.discovery_key()),
            Some(&JoinOpts { announce: true })
        );

        // the remote notices the destroyed stream
        remote.run().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_apply_policy_off() -> Result<()> {
        let dir = testdir::testdir!();
        let discovery = TestDiscovery::default();
        let swarm = SwarmHandle::spawn(discovery.clone());
        let handle = archive(dir.clone(), ArchiveKey::generate()).await?;

        // not swarming and asked not to swarm: nothing to do
        swarm.apply_policy(handle.clone(), SwarmOpts::OFF).await?;
        assert_eq!(discovery.joins(), 0);

        swarm.apply_policy(handle.clone(), SwarmOpts::FULL).await?;
        swarm.apply_policy(handle.clone(), SwarmOpts::OFF).await?;
        assert_eq!(handle.swarm_opts(), None);
        assert_eq!(discovery.joins(), 1);
        assert_eq!(discovery.leaves(), 1);
        assert!(discovery.joined.lock().is_empty());

        // connections for an archive that is not swarming are dropped
        let (conn, io) = connect(handle.discovery_key());
        swarm.handle_connection(conn).await?;
        let mut remote = remote_stream(dir, handle.key(), io).await?;
        assert!(remote.handshake().await.is_err());
        assert!(swarm.streams(handle.key()).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_counting() -> Result<()> {
        let dir = testdir::testdir!();
        let swarm = SwarmHandle::spawn(TestDiscovery::default());
        let handle = archive(dir.clone(), ArchiveKey::generate()).await?;
        swarm.apply_policy(handle.clone(), SwarmOpts::FULL).await?;
        assert_eq!(handle.num_peers(), 1);

        let mut remotes = Vec::new();
        for _ in 0..2 {
            let (conn, io) = connect(handle.discovery_key());
            swarm.handle_connection(conn).await?;
            let mut remote = remote_stream(dir.clone(), handle.key(), io).await?;
            remote.handshake().await?;
            remotes.push(remote);
        }
        wait_for(|| handle.num_peers() == 3).await;
        let streams = swarm.streams(handle.key()).await?;
        assert_eq!(streams.len(), 2);
        assert!(streams.iter().all(|s| s.state == StreamState::Active));

        // one peer goes away
        drop(remotes.pop());
        wait_for(|| handle.num_peers() == 2).await;
        assert_eq!(swarm.streams(handle.key()).await?.len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() -> Result<()> {
        let dir = testdir::testdir!();
        let swarm = SwarmHandle::spawn(TestDiscovery::default());
        let handle = archive(dir, ArchiveKey::generate()).await?;
        swarm.apply_policy(handle.clone(), SwarmOpts::FULL).await?;

        // a peer that never answers
        let (conn, _silent) = connect(handle.discovery_key());
        swarm.handle_connection(conn).await?;
        let streams = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let streams = swarm.streams(handle.key()).await?;
                if !streams.is_empty() {
                    return anyhow::Ok(streams);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .context("connection never became a stream")??;
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].state, StreamState::HandshakePending);

        // still waiting just before the deadline
        tokio::time::sleep(HANDSHAKE_TIMEOUT - Duration::from_secs(1)).await;
        let streams = swarm.streams(handle.key()).await?;
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].state, StreamState::HandshakePending);

        // and gone right after it
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(swarm.streams(handle.key()).await?.is_empty());
        assert_eq!(handle.num_peers(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_forget_and_shutdown() -> Result<()> {
        let dir = testdir::testdir!();
        let discovery = TestDiscovery::default();
        let swarm = SwarmHandle::spawn(discovery.clone());
        let a = archive(dir.clone(), ArchiveKey::generate()).await?;
        let b = archive(dir.clone(), ArchiveKey::generate()).await?;
        swarm.apply_policy(a.clone(), SwarmOpts::FULL).await?;
        swarm.apply_policy(b.clone(), SwarmOpts::FULL).await?;

        swarm.apply_policy(a.clone(), SwarmOpts::OFF).await?;
        swarm.forget(a.key()).await?;
        // unknown topic now
        let (conn, io) = connect(a.discovery_key());
        swarm.handle_connection(conn).await?;
        let mut remote = remote_stream(dir, a.key(), io).await?;
        assert!(remote.handshake().await.is_err());

        swarm.shutdown().await?;
        assert_eq!(b.swarm_opts(), None);
        assert!(discovery.joined.lock().is_empty());
        assert!(swarm.streams(b.key()).await.is_err());
        Ok(())
    }
}
