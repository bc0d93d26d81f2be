//! The set of loaded archives.
//!
//! Loads are deduplicated: while an archive is being opened, every further
//! [`Registry::load`] of the same key waits for the same shared future instead of opening
//! the storage a second time. The open itself runs on its own task, so callers giving up
//! on a load never leave it half done.
//!
//! Closes work the same way. A closing archive is removed from the registry right away and
//! loads of its key wait until the storage is closed before opening it again.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use futures_util::{
    future::{BoxFuture, Either, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error_span, info, warn, Instrument};

use crate::{
    archive::ArchiveHandle,
    key::ArchiveKey,
    path::ensure_archive_dir,
    storage::{ArchiveStorage, Storage},
    swarm::{SwarmHandle, SwarmOpts},
};

/// Error when loading an archive.
///
/// Cloneable, as it is handed to every caller waiting for the same load.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    /// Opening the storage failed.
    #[error("failed to load archive: {0:#}")]
    Storage(Arc<anyhow::Error>),
    /// The task opening the storage did not finish.
    #[error("archive load did not complete: {0}")]
    Aborted(String),
}

impl From<anyhow::Error> for LoadError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(Arc::new(err))
    }
}

type LoadFuture<A> = Shared<BoxFuture<'static, Result<ArchiveHandle<A>, LoadError>>>;
type CloseFuture = Shared<BoxFuture<'static, ()>>;

/// Loaded archives and the loads in progress.
pub struct Registry<S: Storage> {
    inner: Arc<Inner<S>>,
}

struct Inner<S: Storage> {
    root: PathBuf,
    storage: S,
    swarm: SwarmHandle<S::Archive>,
    state: Mutex<State<S::Archive>>,
}

struct State<A> {
    archives: BTreeMap<ArchiveKey, ArchiveHandle<A>>,
    pending: HashMap<ArchiveKey, LoadFuture<A>>,
    closing: HashMap<ArchiveKey, CloseFuture>,
}

impl<S: Storage> Clone for Registry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Storage> fmt::Debug for Registry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Registry")
            .field("root", &self.inner.root)
            .field("loaded", &state.archives.len())
            .field("loading", &state.pending.len())
            .field("closing", &state.closing.len())
            .finish_non_exhaustive()
    }
}

impl<S: Storage> Registry<S> {
    /// Create a registry storing archives below `root`.
    pub fn new(root: PathBuf, storage: S, swarm: SwarmHandle<S::Archive>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root,
                storage,
                swarm,
                state: Mutex::new(State {
                    archives: Default::default(),
                    pending: Default::default(),
                    closing: Default::default(),
                }),
            }),
        }
    }

    /// The data directory of the registry.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// The swarm the loaded archives are replicated in.
    pub fn swarm(&self) -> &SwarmHandle<S::Archive> {
        &self.inner.swarm
    }

    /// Load the archive with `key`, opening or creating its storage if it is not loaded yet.
    ///
    /// A newly loaded archive joins the swarm with [`SwarmOpts::FULL`]. Failing to join is
    /// logged and leaves the archive loaded but not swarming. If the archive is being
    /// closed, the load waits for the close to finish and then opens it again.
    pub async fn load(&self, key: ArchiveKey) -> Result<ArchiveHandle<S::Archive>, LoadError> {
        loop {
            let wait = {
                let mut state = self.inner.state.lock();
                if let Some(closing) = state.closing.get(&key).cloned() {
                    Either::Right(closing)
                } else if let Some(handle) = state.archives.get(&key) {
                    return Ok(handle.clone());
                } else if let Some(fut) = state.pending.get(&key).cloned() {
                    Either::Left(fut)
                } else {
                    let fut = self.start_load(key);
                    state.pending.insert(key, fut.clone());
                    Either::Left(fut)
                }
            };
            match wait {
                Either::Left(load) => return load.await,
                Either::Right(closing) => {
                    debug!(key = %key.fmt_short(), "waiting for archive to close");
                    closing.await;
                }
            }
        }
    }

    /// Spawn the task opening the archive.
    ///
    /// Must be called with the state lock held, so the pending entry is in place before the
    /// task can settle.
    fn start_load(&self, key: ArchiveKey) -> LoadFuture<S::Archive> {
        let guard = PendingGuard {
            inner: self.inner.clone(),
            key,
            settled: false,
        };
        let inner = self.inner.clone();
        let task = tokio::task::spawn(
            async move {
                let res = open(&inner, key).await.map_err(|err| {
                    warn!("failed to load archive: {err:#}");
                    LoadError::from(err)
                });
                guard.settle(&res);
                res
            }
            .instrument(error_span!("load", key = %key.fmt_short())),
        );
        async move {
            match task.await {
                Ok(res) => res,
                Err(err) => Err(LoadError::Aborted(err.to_string())),
            }
        }
        .boxed()
        .shared()
    }

    /// Get a loaded archive.
    pub fn get(&self, key: &ArchiveKey) -> Option<ArchiveHandle<S::Archive>> {
        self.inner.state.lock().archives.get(key).cloned()
    }

    /// Whether a load of `key` is in progress.
    pub fn is_loading(&self, key: &ArchiveKey) -> bool {
        self.inner.state.lock().pending.contains_key(key)
    }

    /// All loaded archives.
    pub fn list(&self) -> Vec<ArchiveHandle<S::Archive>> {
        self.inner.state.lock().archives.values().cloned().collect()
    }

    /// Close a loaded archive: leave the swarm, destroy its streams and close the storage.
    ///
    /// The archive is unregistered and marked [closed](ArchiveHandle::is_closed) before
    /// anything else happens, so handles still held elsewhere never rejoin the swarm.
    /// Closing an archive that is not loaded does nothing, closing one that is already
    /// being closed waits for that close. A load in progress is not affected.
    pub async fn close(&self, key: ArchiveKey) -> Result<()> {
        let started = {
            let mut state = self.inner.state.lock();
            match state.closing.get(&key).cloned() {
                Some(closing) => Either::Left(closing),
                None => {
                    let Some(handle) = state.archives.remove(&key) else {
                        return Ok(());
                    };
                    handle.mark_closed();
                    let (done_tx, done_rx) = oneshot::channel::<()>();
                    state
                        .closing
                        .insert(key, done_rx.map(|_| ()).boxed().shared());
                    Either::Right((handle, done_tx))
                }
            }
        };
        let (handle, done) = match started {
            Either::Left(closing) => {
                closing.await;
                return Ok(());
            }
            Either::Right(started) => started,
        };
        let guard = ClosingGuard {
            inner: self.inner.clone(),
            key,
            _done: done,
        };
        let swarm = self.inner.swarm.clone();
        let task = tokio::task::spawn(
            async move {
                let _guard = guard;
                debug!("closing archive");
                swarm.apply_policy(handle.clone(), SwarmOpts::OFF).await?;
                swarm.forget(key).await?;
                handle.storage().close().await
            }
            .instrument(error_span!("close", key = %key.fmt_short())),
        );
        task.await
            .context("close task failed")?
            .with_context(|| format!("failed to close archive {}", key.fmt_short()))
    }

    /// Close all loaded archives concurrently.
    ///
    /// Every archive is attempted; failures are logged and the first one is returned.
    pub async fn close_all(&self) -> Result<()> {
        let keys: Vec<ArchiveKey> = self.inner.state.lock().archives.keys().copied().collect();
        info!(count = keys.len(), "closing all archives");
        let results =
            futures_util::future::join_all(keys.into_iter().map(|key| async move {
                (key, self.close(key).await)
            }))
            .await;
        let mut first_err = None;
        for (key, res) in results {
            if let Err(err) = res {
                warn!(key = %key.fmt_short(), "failed to close archive: {err:#}");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn open<S: Storage>(inner: &Inner<S>, key: ArchiveKey) -> Result<ArchiveHandle<S::Archive>> {
    let path = ensure_archive_dir(&inner.root, &key).await?;
    let storage = inner
        .storage
        .create(path.clone(), key)
        .await
        .context("failed to open archive storage")?;
    if let Err(err) = storage.ready().await {
        storage.close().await.ok();
        return Err(err.context("archive storage did not become ready"));
    }
    let handle = ArchiveHandle::new(storage, path);
    if let Err(err) = inner
        .swarm
        .apply_policy(handle.clone(), SwarmOpts::default())
        .await
    {
        warn!("failed to join swarm: {err:#}");
    }
    debug!("archive loaded");
    Ok(handle)
}

/// Removes the pending entry of a load, even if the loading task is dropped or panics.
struct PendingGuard<S: Storage> {
    inner: Arc<Inner<S>>,
    key: ArchiveKey,
    settled: bool,
}

impl<S: Storage> PendingGuard<S> {
    /// Remove the pending entry and register the archive on success, atomically.
    fn settle(mut self, res: &Result<ArchiveHandle<S::Archive>, LoadError>) {
        let mut state = self.inner.state.lock();
        state.pending.remove(&self.key);
        if let Ok(handle) = res {
            state.archives.insert(self.key, handle.clone());
        }
        drop(state);
        self.settled = true;
    }
}

impl<S: Storage> Drop for PendingGuard<S> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.state.lock().pending.remove(&self.key);
        }
    }
}

/// Removes the closing entry of an archive once its close is done, waking waiting loads.
struct ClosingGuard<S: Storage> {
    inner: Arc<Inner<S>>,
    key: ArchiveKey,
    _done: oneshot::Sender<()>,
}

impl<S: Storage> Drop for ClosingGuard<S> {
    fn drop(&mut self) {
        self.inner.state.lock().closing.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestDiscovery, TestStorage};

    fn registry(storage: TestStorage) -> (Registry<TestStorage>, TestDiscovery) {
        let discovery = TestDiscovery::default();
        let swarm = SwarmHandle::spawn(discovery.clone());
        (
            Registry::new(testdir::testdir!(), storage, swarm),
            discovery,
        )
    }

    #[tokio::test]
    async fn test_concurrent_loads_open_once() -> Result<()> {
        let storage = TestStorage::default();
        let (registry, discovery) = registry(storage.clone());
        let key = ArchiveKey::generate();

        let mut first = Box::pin(registry.load(key));
        assert!(futures_lite::future::poll_once(&mut first).await.is_none());
        assert!(registry.is_loading(&key));
        let rest = futures_util::future::join_all((0..8).map(|_| registry.load(key))).await;
        let first = first.await?;
        for handle in rest {
            assert!(handle?.ptr_eq(&first));
        }
        assert_eq!(storage.opens(), 1);
        assert_eq!(discovery.joins(), 1);
        assert!(!registry.is_loading(&key));
        assert_eq!(first.swarm_opts(), Some(SwarmOpts::FULL));
        assert_eq!(registry.list().len(), 1);

        // loaded: no further open
        assert!(registry.load(key).await?.ptr_eq(&first));
        assert_eq!(storage.opens(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_load_retry() -> Result<()> {
        let storage = TestStorage::default();
        let (registry, _discovery) = registry(storage.clone());
        let key = ArchiveKey::generate();

        storage.set_fail(true);
        let (a, b) = tokio::join!(registry.load(key), registry.load(key));
        assert!(matches!(a, Err(LoadError::Storage(_))));
        assert!(b.is_err());
        assert_eq!(storage.opens(), 1);
        assert!(!registry.is_loading(&key));
        assert!(registry.get(&key).is_none());

        storage.set_fail(false);
        let handle = registry.load(key).await?;
        assert_eq!(storage.opens(), 2);
        assert!(registry.get(&key).is_some_and(|h| h.ptr_eq(&handle)));
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_caller_completes_load() -> Result<()> {
        let storage = TestStorage::default();
        let (registry, _discovery) = registry(storage.clone());
        let key = ArchiveKey::generate();

        // poll the load once, then give up on it
        let load = registry.load(key);
        let _ = futures_lite::future::poll_once(Box::pin(load)).await;
        assert!(registry.is_loading(&key));

        crate::test_utils::wait_for(|| registry.get(&key).is_some()).await;
        assert!(!registry.is_loading(&key));
        assert_eq!(storage.opens(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_close() -> Result<()> {
        let storage = TestStorage::default();
        let (registry, discovery) = registry(storage.clone());
        let key = ArchiveKey::generate();

        // not loaded
        registry.close(key).await?;

        let handle = registry.load(key).await?;
        registry.close(key).await?;
        assert!(registry.get(&key).is_none());
        assert_eq!(handle.swarm_opts(), None);
        assert_eq!(discovery.leaves(), 1);
        assert!(handle.storage().ready().await.is_err());

        // twice
        registry.close(key).await?;
        assert_eq!(discovery.leaves(), 1);

        // and load again
        let reloaded = registry.load(key).await?;
        assert!(!reloaded.ptr_eq(&handle));
        assert_eq!(storage.opens(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_load_while_closing() -> Result<()> {
        let storage = TestStorage::default();
        let (registry, discovery) = registry(storage.clone());
        let key = ArchiveKey::generate();
        let old = registry.load(key).await?;

        let (closed, reloaded) = tokio::join!(registry.close(key), async {
            tokio::task::yield_now().await;
            registry.load(key).await
        });
        closed?;
        let reloaded = reloaded?;
        assert!(old.is_closed());
        assert!(!reloaded.ptr_eq(&old));
        assert!(!reloaded.is_closed());
        assert!(reloaded.storage().ready().await.is_ok());
        assert_eq!(reloaded.swarm_opts(), Some(SwarmOpts::FULL));
        assert!(registry.get(&key).is_some_and(|h| h.ptr_eq(&reloaded)));
        assert_eq!(storage.opens(), 2);
        assert_eq!(discovery.joins(), 2);
        assert_eq!(discovery.joined.lock().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_policy_after_close_is_ignored() -> Result<()> {
        let (registry, discovery) = registry(TestStorage::default());
        let key = ArchiveKey::generate();
        let stale = registry.load(key).await?;
        registry.close(key).await?;
        assert!(stale.is_closed());

        // a reconciliation still holding the handle
        let swarm = registry.swarm();
        let seed_only = SwarmOpts {
            upload: true,
            download: false,
        };
        swarm.apply_policy(stale.clone(), seed_only).await?;
        assert_eq!(stale.swarm_opts(), None);
        assert_eq!(discovery.joins(), 1);
        assert!(discovery.joined.lock().is_empty());

        // nor does it touch the archive once loaded again
        let fresh = registry.load(key).await?;
        swarm.apply_policy(stale.clone(), SwarmOpts::OFF).await?;
        swarm.apply_policy(stale, seed_only).await?;
        assert_eq!(fresh.swarm_opts(), Some(SwarmOpts::FULL));
        assert_eq!(discovery.joins(), 2);
        assert_eq!(discovery.leaves(), 1);
        assert_eq!(discovery.joined.lock().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_all() -> Result<()> {
        let (registry, discovery) = registry(TestStorage::default());
        for _ in 0..3 {
            registry.load(ArchiveKey::generate()).await?;
        }
        registry.close_all().await?;
        assert!(registry.list().is_empty());
        assert_eq!(discovery.leaves(), 3);
        assert!(discovery.joined.lock().is_empty());
        Ok(())
    }
}
