//! Internal utilities to support testing.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{ensure, Result};
use parking_lot::Mutex;
use tokio::io::DuplexStream;

use crate::{
    archive::ArchiveHandle,
    key::{ArchiveKey, DiscoveryKey},
    storage::{fs::FsArchive, ArchiveStorage, ReplicateOpts, Storage},
    swarm::{Connection, ConnectionSender, Direction, Discovery, JoinOpts},
};

/// Records joins and leaves, never produces connections by itself.
#[derive(Debug, Clone, Default)]
pub(crate) struct TestDiscovery {
    pub(crate) joins: Arc<AtomicUsize>,
    pub(crate) leaves: Arc<AtomicUsize>,
    pub(crate) joined: Arc<Mutex<HashMap<DiscoveryKey, JoinOpts>>>,
}

impl TestDiscovery {
    pub(crate) fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub(crate) fn leaves(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }
}

impl Discovery for TestDiscovery {
    async fn join(
        &self,
        topic: DiscoveryKey,
        opts: JoinOpts,
        _connections: ConnectionSender,
    ) -> Result<()> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        self.joined.lock().insert(topic, opts);
        Ok(())
    }

    async fn leave(&self, topic: DiscoveryKey) -> Result<()> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        self.joined.lock().remove(&topic);
        Ok(())
    }
}

/// [`FsArchive`] storage that counts opens, takes a while to open and can be told to fail.
#[derive(Debug, Clone, Default)]
pub(crate) struct TestStorage {
    pub(crate) opens: Arc<AtomicUsize>,
    pub(crate) fail: Arc<AtomicBool>,
}

impl TestStorage {
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Storage for TestStorage {
    type Archive = FsArchive;

    async fn create(&self, path: PathBuf, key: ArchiveKey) -> Result<FsArchive> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        ensure!(!self.fail.load(Ordering::SeqCst), "injected open failure");
        FsArchive::open(path, key).await
    }
}

/// Open a fresh archive in `dir`.
pub(crate) async fn archive(dir: PathBuf, key: ArchiveKey) -> Result<ArchiveHandle<FsArchive>> {
    let dir = dir.join(key.to_hex());
    let storage = FsArchive::open(dir.clone(), key).await?;
    Ok(ArchiveHandle::new(storage, dir))
}

/// An inbound connection for `topic`, and the remote end of it.
pub(crate) fn connect(topic: DiscoveryKey) -> (Connection, DuplexStream) {
    let (ours, theirs) = tokio::io::duplex(4096);
    let conn = Connection {
        topic,
        direction: Direction::Inbound,
        io: Box::new(ours),
    };
    (conn, theirs)
}

/// A remote peer replicating the archive `key` over `io`.
pub(crate) async fn remote_stream(
    dir: PathBuf,
    key: ArchiveKey,
    io: DuplexStream,
) -> Result<<FsArchive as ArchiveStorage>::Stream> {
    let storage = FsArchive::open(dir.join("remote").join(key.to_hex()), key).await?;
    Ok(storage.replicate(
        Box::new(io),
        ReplicateOpts {
            upload: true,
            download: true,
            live: true,
        },
    ))
}

/// Wait until `f` holds, polling every few milliseconds.
pub(crate) async fn wait_for(mut f: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
