//! Handle to a loaded archive.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    key::{ArchiveKey, DiscoveryKey},
    manifest::CachedManifest,
    storage::{ArchiveStorage, SyncProgress},
    swarm::SwarmOpts,
};

/// A locally stored archive, shared between the registry, the swarm and the jobs.
///
/// Cloning is cheap. The swarm related fields are only ever written by the swarm actor and
/// the disk usage only by the disk usage job; everybody else reads.
pub struct ArchiveHandle<A> {
    inner: Arc<Inner<A>>,
}

struct Inner<A> {
    key: ArchiveKey,
    discovery_key: DiscoveryKey,
    path: PathBuf,
    storage: A,
    num_peers: AtomicUsize,
    swarm_opts: Mutex<Option<SwarmOpts>>,
    manifest: Mutex<Option<CachedManifest>>,
    disk_usage: AtomicU64,
    closed: AtomicBool,
}

impl<A> Clone for ArchiveHandle<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> fmt::Debug for ArchiveHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("key", &self.inner.key)
            .field("num_peers", &self.num_peers())
            .field("swarm_opts", &self.swarm_opts())
            .field("disk_usage", &self.disk_usage())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<A: ArchiveStorage> ArchiveHandle<A> {
    pub(crate) fn new(storage: A, path: PathBuf) -> Self {
        let key = storage.key();
        Self {
            inner: Arc::new(Inner {
                key,
                discovery_key: storage.discovery_key(),
                path,
                storage,
                num_peers: AtomicUsize::new(1),
                swarm_opts: Mutex::new(None),
                manifest: Mutex::new(None),
                disk_usage: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Current block accounting of the underlying storage.
    pub fn progress(&self) -> SyncProgress {
        self.inner.storage.progress()
    }
}

impl<A> ArchiveHandle<A> {
    /// Key of the archive.
    pub fn key(&self) -> ArchiveKey {
        self.inner.key
    }

    /// Key under which the archive is found in the swarm.
    pub fn discovery_key(&self) -> DiscoveryKey {
        self.inner.discovery_key
    }

    /// Directory holding the archive.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The underlying storage.
    pub fn storage(&self) -> &A {
        &self.inner.storage
    }

    /// Number of peers replicating this archive, counting ourselves.
    pub fn num_peers(&self) -> usize {
        self.inner.num_peers.load(Ordering::Relaxed)
    }

    /// The swarm policy last applied, `None` while not swarming.
    pub fn swarm_opts(&self) -> Option<SwarmOpts> {
        *self.inner.swarm_opts.lock()
    }

    /// Size of the archive on disk as of the last disk usage run.
    pub fn disk_usage(&self) -> u64 {
        self.inner.disk_usage.load(Ordering::Relaxed)
    }

    /// Whether the archive was closed. A closed archive never joins the swarm again.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same loaded archive.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_num_peers(&self, num_peers: usize) {
        self.inner.num_peers.store(num_peers, Ordering::Relaxed);
    }

    pub(crate) fn set_swarm_opts(&self, opts: Option<SwarmOpts>) {
        *self.inner.swarm_opts.lock() = opts;
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_disk_usage(&self, bytes: u64) {
        self.inner.disk_usage.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn manifest_slot(&self) -> &Mutex<Option<CachedManifest>> {
        &self.inner.manifest
    }
}
