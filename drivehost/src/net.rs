//! A minimal [`Discovery`] over TCP.
//!
//! [`TcpSwarm`] listens on a socket and knows a static list of bootstrap peers. Joining a
//! topic dials every peer; each connection starts with the 32 byte discovery key of the
//! topic it is for. Inbound connections are only accepted for topics joined with
//! `announce` set.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::{
    key::{DiscoveryKey, KEY_LEN},
    swarm::{Connection, ConnectionSender, Direction, Discovery, JoinOpts},
};

/// Time a peer has to send the topic after connecting.
pub const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of attempts to connect to a bootstrap peer.
const DIAL_ATTEMPTS: u32 = 5;
/// Delay before the first redial, doubled on every further attempt.
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

type Topics = Arc<Mutex<HashMap<DiscoveryKey, Topic>>>;

#[derive(Debug)]
struct Topic {
    announce: bool,
    connections: ConnectionSender,
    _dials: Vec<AbortOnDropHandle<()>>,
}

/// Swarm transport over plain TCP with static bootstrap peers.
#[derive(Debug, Clone)]
pub struct TcpSwarm {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    local_addr: SocketAddr,
    peers: Vec<SocketAddr>,
    topics: Topics,
    _accept_task: AbortOnDropHandle<()>,
}

impl TcpSwarm {
    /// Listen on `addr` and dial `peers` for every joined topic.
    pub async fn bind(addr: SocketAddr, peers: Vec<SocketAddr>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;
        let topics = Topics::default();
        let task = tokio::task::spawn(
            accept_loop(listener, topics.clone()).instrument(error_span!("tcp", %local_addr)),
        );
        debug!(%local_addr, peers = peers.len(), "tcp swarm listening");
        Ok(Self {
            inner: Arc::new(Inner {
                local_addr,
                peers,
                topics,
                _accept_task: AbortOnDropHandle::new(task),
            }),
        })
    }

    /// The address we are listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }
}

impl Discovery for TcpSwarm {
    async fn join(
        &self,
        topic: DiscoveryKey,
        opts: JoinOpts,
        connections: ConnectionSender,
    ) -> Result<()> {
        let dials = self
            .inner
            .peers
            .iter()
            .filter(|addr| **addr != self.inner.local_addr)
            .map(|&addr| {
                let task = tokio::task::spawn(
                    dial(addr, topic, connections.clone())
                        .instrument(error_span!("dial", %addr, topic = %topic.fmt_short())),
                );
                AbortOnDropHandle::new(task)
            })
            .collect();
        let topic_state = Topic {
            announce: opts.announce,
            connections,
            _dials: dials,
        };
        // replacing an entry aborts its dials
        self.inner.topics.lock().insert(topic, topic_state);
        trace!(topic = %topic.fmt_short(), announce = opts.announce, "joined");
        Ok(())
    }

    async fn leave(&self, topic: DiscoveryKey) -> Result<()> {
        self.inner.topics.lock().remove(&topic);
        trace!(topic = %topic.fmt_short(), "left");
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, topics: Topics) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    let topics = topics.clone();
                    tasks.spawn(async move {
                        if let Err(err) = accept(stream, topics).await {
                            debug!("rejected connection: {err:#}");
                        }
                    }.instrument(error_span!("accept", %addr)));
                }
                Err(err) => {
                    warn!("failed to accept connection: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = res {
                    warn!("accept task failed: {err}");
                }
            }
        }
    }
}

async fn accept(mut stream: TcpStream, topics: Topics) -> Result<()> {
    let mut preamble = [0u8; KEY_LEN];
    tokio::time::timeout(PREAMBLE_TIMEOUT, stream.read_exact(&mut preamble))
        .await
        .context("timed out waiting for topic")?
        .context("failed to read topic")?;
    let topic = DiscoveryKey::from_bytes(preamble);
    let connections = {
        let topics = topics.lock();
        match topics.get(&topic) {
            Some(state) if state.announce => state.connections.clone(),
            _ => return Err(anyhow!("topic {} is not announced", topic.fmt_short())),
        }
    };
    stream.set_nodelay(true)?;
    trace!(topic = %topic.fmt_short(), "accepted connection");
    connections
        .send(Connection {
            topic,
            direction: Direction::Inbound,
            io: Box::new(stream),
        })
        .await
        .map_err(|_| anyhow!("swarm closed"))
}

async fn dial(addr: SocketAddr, topic: DiscoveryKey, connections: ConnectionSender) {
    let mut delay = DIAL_RETRY_DELAY;
    for attempt in 1..=DIAL_ATTEMPTS {
        match connect(addr, topic).await {
            Ok(stream) => {
                trace!(attempt, "connected");
                let conn = Connection {
                    topic,
                    direction: Direction::Outbound,
                    io: Box::new(stream),
                };
                if connections.send(conn).await.is_err() {
                    debug!("swarm closed, dropping connection");
                }
                return;
            }
            Err(err) => {
                debug!(attempt, "dial failed: {err:#}");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
    debug!("giving up on peer");
}

async fn connect(addr: SocketAddr, topic: DiscoveryKey) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    stream.write_all(topic.as_bytes()).await?;
    stream.flush().await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::key::ArchiveKey;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().expect("valid addr")
    }

    #[tokio::test]
    async fn test_dial_and_accept() -> Result<()> {
        let a = TcpSwarm::bind(localhost(), vec![]).await?;
        let b = TcpSwarm::bind(localhost(), vec![a.local_addr()]).await?;
        let topic = ArchiveKey::generate().discovery_key();

        let (a_tx, mut a_rx) = mpsc::channel(8);
        a.join(topic, JoinOpts { announce: true }, a_tx).await?;
        let (b_tx, mut b_rx) = mpsc::channel(8);
        b.join(topic, JoinOpts { announce: false }, b_tx).await?;

        let inbound = a_rx.recv().await.context("no inbound connection")?;
        assert_eq!(inbound.topic, topic);
        assert_eq!(inbound.direction, Direction::Inbound);
        let outbound = b_rx.recv().await.context("no outbound connection")?;
        assert_eq!(outbound.topic, topic);
        assert_eq!(outbound.direction, Direction::Outbound);

        // the connection is usable in both directions
        let (mut inbound, mut outbound) = (inbound.io, outbound.io);
        outbound.write_all(b"ping").await?;
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");
        Ok(())
    }

    #[tokio::test]
    async fn test_unannounced_topic_rejected() -> Result<()> {
        let a = TcpSwarm::bind(localhost(), vec![]).await?;
        let topic = ArchiveKey::generate().discovery_key();
        let (tx, mut rx) = mpsc::channel(8);
        a.join(topic, JoinOpts { announce: false }, tx).await?;

        let mut stream = connect(a.local_addr(), topic).await?;
        let mut buf = [0u8; 1];
        // closed by the remote without delivering the connection
        assert_eq!(stream.read(&mut buf).await.unwrap_or(0), 0);
        assert!(rx.try_recv().is_err());

        // unknown after leaving
        a.leave(topic).await?;
        let other = ArchiveKey::generate().discovery_key();
        let mut stream = connect(a.local_addr(), other).await?;
        assert_eq!(stream.read(&mut buf).await.unwrap_or(0), 0);
        Ok(())
    }
}
