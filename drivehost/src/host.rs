//! The host: loaded archives, their swarm and the background jobs, wired together.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{ensure, Context, Result};
use futures_util::{stream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    archive::ArchiveHandle,
    jobs::{
        DiskUsageJob, PopularArchive, PopularIndex, PopularityJob, Scheduler,
        DEFAULT_DISK_USAGE_INTERVAL, DEFAULT_POPULAR_INTERVAL, DEFAULT_POPULAR_MAX,
    },
    key::ArchiveKey,
    manifest::{self, Manifest},
    path::HostPaths,
    registry::{LoadError, Registry},
    storage::{Storage, SyncProgress},
    swarm::{Discovery, SwarmHandle},
    user::UserStore,
};

/// Number of archives opened concurrently by [`Host::resume`].
const RESUME_CONCURRENCY: usize = 16;

/// Options for [`Host::spawn`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding the archives.
    pub data_dir: PathBuf,
    /// Length of the popularity index.
    pub popular_max: usize,
    /// Interval of the popularity job.
    pub popular_interval: Duration,
    /// Interval of the disk usage job.
    pub disk_usage_interval: Duration,
}

impl Options {
    /// Default options storing archives in `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            popular_max: DEFAULT_POPULAR_MAX,
            popular_interval: DEFAULT_POPULAR_INTERVAL,
            disk_usage_interval: DEFAULT_DISK_USAGE_INTERVAL,
        }
    }
}

/// Hosts archives for many users and replicates them into the swarm.
#[derive(derive_more::Debug)]
pub struct Host<S: Storage, U> {
    registry: Registry<S>,
    #[debug("UserStore")]
    users: Arc<U>,
    popular: PopularIndex,
    #[debug("PopularityJob")]
    popularity_job: Arc<PopularityJob<S>>,
    #[debug("DiskUsageJob")]
    disk_usage_job: Arc<DiskUsageJob<S, U>>,
    scheduler: Scheduler,
}

impl<S: Storage, U: UserStore> Host<S, U> {
    /// Start the host.
    ///
    /// Spawns the swarm actor and the background jobs on the current tokio runtime. No
    /// archive is loaded, see [`Host::resume`].
    pub async fn spawn<D: Discovery>(
        storage: S,
        discovery: D,
        users: U,
        opts: Options,
    ) -> Result<Self> {
        ensure!(
            !opts.popular_interval.is_zero() && !opts.disk_usage_interval.is_zero(),
            "job intervals must not be zero"
        );
        let archives = HostPaths::Archives.with_root(&opts.data_dir);
        tokio::fs::create_dir_all(&archives)
            .await
            .with_context(|| format!("failed to create {}", archives.display()))?;

        let swarm = SwarmHandle::spawn(discovery);
        let registry = Registry::new(opts.data_dir.clone(), storage, swarm);
        let users = Arc::new(users);
        let popular = PopularIndex::default();
        let popularity_job = Arc::new(PopularityJob::new(
            registry.clone(),
            popular.clone(),
            opts.popular_max,
        ));
        let disk_usage_job = Arc::new(DiskUsageJob::new(registry.clone(), users.clone()));

        let scheduler = Scheduler::new();
        scheduler.spawn_job(popularity_job.clone(), opts.popular_interval);
        scheduler.spawn_job(disk_usage_job.clone(), opts.disk_usage_interval);
        info!(data_dir = %opts.data_dir.display(), "host started");

        Ok(Self {
            registry,
            users,
            popular,
            popularity_job,
            disk_usage_job,
            scheduler,
        })
    }

    /// The archive registry.
    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    /// The user store.
    pub fn users(&self) -> &U {
        &self.users
    }

    /// Load an archive, see [`Registry::load`].
    pub async fn load(&self, key: ArchiveKey) -> Result<ArchiveHandle<S::Archive>, LoadError> {
        self.registry.load(key).await
    }

    /// Get a loaded archive.
    pub fn get(&self, key: &ArchiveKey) -> Option<ArchiveHandle<S::Archive>> {
        self.registry.get(key)
    }

    /// Whether a load of `key` is in progress.
    pub fn is_loading(&self, key: &ArchiveKey) -> bool {
        self.registry.is_loading(key)
    }

    /// Close an archive, see [`Registry::close`].
    pub async fn close(&self, key: ArchiveKey) -> Result<()> {
        self.registry.close(key).await
    }

    /// Close all archives.
    pub async fn close_all(&self) -> Result<()> {
        self.registry.close_all().await
    }

    /// Metadata of a loaded archive.
    pub async fn manifest(&self, key: &ArchiveKey) -> Option<Manifest> {
        let handle = self.registry.get(key)?;
        manifest::manifest(&handle).await
    }

    /// The most popular loaded archives as of the last popularity run.
    pub fn popular(&self) -> Arc<Vec<PopularArchive>> {
        self.popular.get()
    }

    /// Sync progress of a loaded archive.
    pub fn progress(&self, key: &ArchiveKey) -> Option<SyncProgress> {
        self.registry.get(key).map(|handle| handle.progress())
    }

    /// Load every archive owned by a user.
    ///
    /// Archives failing to load are logged and skipped. Returns the number of archives
    /// loaded.
    pub async fn resume(&self) -> Result<usize> {
        let users = self.users.list().await.context("failed to list users")?;
        let keys: Vec<ArchiveKey> = users
            .iter()
            .flat_map(|user| user.archives.iter().copied())
            .collect();
        debug!(users = users.len(), archives = keys.len(), "resuming archives");
        let loaded = stream::iter(keys)
            .map(|key| async move { (key, self.registry.load(key).await) })
            .buffer_unordered(RESUME_CONCURRENCY)
            .filter_map(|(key, res)| async move {
                match res {
                    Ok(_) => Some(key),
                    Err(err) => {
                        warn!(key = %key.fmt_short(), "failed to resume archive: {err}");
                        None
                    }
                }
            })
            .count()
            .await;
        info!(loaded, "resumed archives");
        Ok(loaded)
    }

    /// Compute disk usage and apply quotas now.
    pub async fn reconcile_now(&self) {
        self.scheduler.run_now(self.disk_usage_job.as_ref()).await
    }

    /// Rank the loaded archives now.
    pub async fn rank_now(&self) {
        self.scheduler.run_now(self.popularity_job.as_ref()).await
    }

    /// Stop the jobs, close all archives and stop the swarm.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown();
        let res = self.registry.close_all().await;
        self.registry.swarm().shutdown().await?;
        info!("host stopped");
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        manifest::MANIFEST_FILE,
        swarm::SwarmOpts,
        test_utils::{TestDiscovery, TestStorage},
        user::{MemUserStore, UserRecord},
    };

    async fn host(users: MemUserStore) -> Result<Host<TestStorage, MemUserStore>> {
        Host::spawn(
            TestStorage::default(),
            TestDiscovery::default(),
            users,
            Options::new(testdir::testdir!()),
        )
        .await
    }

    #[tokio::test]
    async fn test_resume_and_reconcile() -> Result<()> {
        let users = MemUserStore::default();
        let (a, b) = (ArchiveKey::generate(), ArchiveKey::generate());
        users.insert(UserRecord {
            archives: vec![a, b],
            ..UserRecord::new("alice", 1)
        });
        let host = host(users.clone()).await?;
        assert_eq!(host.resume().await?, 2);
        assert_eq!(host.get(&a).and_then(|h| h.swarm_opts()), Some(SwarmOpts::FULL));

        host.reconcile_now().await;
        for key in [a, b] {
            let opts = host.get(&key).and_then(|h| h.swarm_opts());
            assert_eq!(opts.map(|o| (o.upload, o.download)), Some((true, false)));
        }
        assert!(users.get("alice").is_some_and(|u| u.disk_usage > 0));

        host.rank_now().await;
        assert_eq!(host.popular().len(), 2);

        host.shutdown().await?;
        assert!(host.get(&a).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_manifest_and_progress() -> Result<()> {
        let host = host(MemUserStore::default()).await?;
        let key = ArchiveKey::generate();
        assert_eq!(host.manifest(&key).await, None);
        assert_eq!(host.progress(&key), None);

        let handle = host.load(key).await?;
        assert_eq!(host.progress(&key).map(|p| p.ratio()), Some(0.0));
        handle
            .storage()
            .write_file(MANIFEST_FILE, br#"{"title":"hello"}"#)
            .await?;
        let manifest = host.manifest(&key).await;
        assert_eq!(manifest.and_then(|m| m.title), Some("hello".to_string()));
        assert_eq!(host.progress(&key).map(|p| p.ratio()), Some(1.0));
        Ok(())
    }
}
