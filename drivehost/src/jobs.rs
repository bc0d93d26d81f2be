//! Periodic background jobs.
//!
//! Two jobs keep the host in shape:
//!
//! - [`PopularityJob`] ranks the loaded archives by their number of peers.
//! - [`DiskUsageJob`] measures how much disk every user occupies, persists it and
//!   reconfigures the swarm participation of their archives so that no user grows beyond
//!   their quota: over quota, archives are still served but no longer downloaded. An
//!   archive owned by several users is downloaded only while all of them are below quota.
//!
//! Every job runs under a mutex named after the job. A tick that finds the previous run
//! still in progress is skipped.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, error_span, info, warn, Instrument};

use crate::{
    key::ArchiveKey,
    path::archive_dir,
    registry::Registry,
    storage::Storage,
    swarm::SwarmOpts,
    user::{UserRecord, UserStore},
    util::dir_size,
};

/// Default interval of the [`PopularityJob`].
pub const DEFAULT_POPULAR_INTERVAL: Duration = Duration::from_secs(30);
/// Default interval of the [`DiskUsageJob`].
pub const DEFAULT_DISK_USAGE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default length of the popularity index.
pub const DEFAULT_POPULAR_MAX: usize = 100;

/// A background job.
pub trait Job: Send + Sync + 'static {
    /// Name of the job, also the name of its mutex.
    fn name(&self) -> &'static str;

    /// Run one pass. Errors are handled inside the job.
    fn run(&self) -> impl Future<Output = ()> + Send;
}

/// Runs jobs periodically, at most one pass per job name at a time.
#[derive(Debug, Default)]
pub struct Scheduler {
    locks: Mutex<HashMap<&'static str, Arc<tokio::sync::Mutex<()>>>>,
    tasks: Mutex<Vec<AbortOnDropHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler without jobs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` every `period`, the first time one `period` from now.
    pub fn spawn_job<J: Job>(&self, job: Arc<J>, period: Duration) {
        let lock = self.lock(job.name());
        let name = job.name();
        let task = tokio::task::spawn(
            async move {
                debug!(?period, "job loop starting");
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let Ok(_guard) = lock.try_lock() else {
                        info!("previous run still in progress, skipping");
                        continue;
                    };
                    run_logged(job.as_ref()).await;
                }
            }
            .instrument(error_span!("job", name)),
        );
        self.tasks.lock().push(AbortOnDropHandle::new(task));
    }

    /// Run one pass of `job` now, waiting for a pass in progress to finish first.
    pub async fn run_now<J: Job>(&self, job: &J) {
        let lock = self.lock(job.name());
        let _guard = lock.lock().await;
        run_logged(job)
            .instrument(error_span!("job", name = job.name()))
            .await;
    }

    /// Stop all periodic jobs. Passes in progress are aborted.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn lock(&self, name: &'static str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(name).or_default().clone()
    }
}

async fn run_logged<J: Job>(job: &J) {
    let start = Instant::now();
    info!("job started");
    job.run().await;
    info!(elapsed = ?start.elapsed(), "job finished");
}

/// Entry of the popularity index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularArchive {
    /// Key of the archive.
    pub key: ArchiveKey,
    /// Peers replicating the archive, counting ourselves.
    pub num_peers: usize,
}

/// The most popular loaded archives, most peers first.
///
/// Replaced as a whole on every run of the [`PopularityJob`], readers never see a partial
/// update.
#[derive(Debug, Clone, Default)]
pub struct PopularIndex(Arc<RwLock<Arc<Vec<PopularArchive>>>>);

impl PopularIndex {
    /// Current ranking.
    pub fn get(&self) -> Arc<Vec<PopularArchive>> {
        self.0.read().clone()
    }

    fn publish(&self, list: Vec<PopularArchive>) {
        *self.0.write() = Arc::new(list);
    }
}

/// Sort by number of peers, descending, and keep the first `max`.
///
/// Ties are ordered by key, so the ranking is deterministic.
pub fn rank(items: impl IntoIterator<Item = PopularArchive>, max: usize) -> Vec<PopularArchive> {
    let mut items: Vec<_> = items.into_iter().collect();
    items.sort_by(|a, b| {
        b.num_peers
            .cmp(&a.num_peers)
            .then_with(|| a.key.cmp(&b.key))
    });
    items.truncate(max);
    items
}

/// Ranks the loaded archives into a [`PopularIndex`].
#[derive(Debug)]
pub struct PopularityJob<S: Storage> {
    registry: Registry<S>,
    index: PopularIndex,
    max: usize,
}

impl<S: Storage> PopularityJob<S> {
    /// Create the job, publishing the `max` most popular archives to `index`.
    pub fn new(registry: Registry<S>, index: PopularIndex, max: usize) -> Self {
        Self {
            registry,
            index,
            max,
        }
    }
}

impl<S: Storage> Job for PopularityJob<S> {
    fn name(&self) -> &'static str {
        "popular"
    }

    async fn run(&self) {
        let loaded = self.registry.list();
        let list = rank(
            loaded.iter().map(|handle| PopularArchive {
                key: handle.key(),
                num_peers: handle.num_peers(),
            }),
            self.max,
        );
        debug!(loaded = loaded.len(), ranked = list.len(), "ranked archives");
        self.index.publish(list);
    }
}

/// Swarm policy for a user with `usage` bytes of a `quota` bytes quota.
///
/// Archives are always served. They are downloaded only while the user is below quota; a
/// quota of zero counts as exceeded.
pub fn quota_policy(usage: u64, quota: u64) -> SwarmOpts {
    let download = if quota == 0 {
        false
    } else {
        (usage as f64 / quota as f64) < 1.0
    };
    SwarmOpts {
        upload: true,
        download,
    }
}

/// Computes disk usage per user and gates the download of archives of users over quota.
///
/// Loaded archives no user owns any more are closed.
#[derive(Debug)]
pub struct DiskUsageJob<S: Storage, U> {
    registry: Registry<S>,
    users: Arc<U>,
}

impl<S: Storage, U: UserStore> DiskUsageJob<S, U> {
    /// Create the job.
    pub fn new(registry: Registry<S>, users: Arc<U>) -> Self {
        Self { registry, users }
    }

    /// Measure and persist the usage of `user`.
    ///
    /// Returns the policy the user's quota allows and the size of each of their archives.
    async fn reconcile_user(
        &self,
        user: &UserRecord,
    ) -> Result<(SwarmOpts, Vec<(ArchiveKey, u64)>)> {
        let mut usage = 0u64;
        let mut sizes = Vec::with_capacity(user.archives.len());
        for key in &user.archives {
            let dir = archive_dir(self.registry.root(), key);
            let size = dir_size(dir)
                .await
                .with_context(|| format!("failed to measure archive {}", key.fmt_short()))?;
            usage = usage.saturating_add(size);
            sizes.push((*key, size));
        }
        self.users
            .update_disk_usage(&user.id, usage)
            .await
            .context("failed to store disk usage")?;

        let opts = quota_policy(usage, user.disk_quota);
        debug!(usage, quota = user.disk_quota, ?opts, "disk usage computed");
        Ok((opts, sizes))
    }
}

/// Combine the policies of two owners of the same archive.
///
/// Served if any owner allows it, downloaded only if every owner is below quota.
fn merge_policy(a: SwarmOpts, b: SwarmOpts) -> SwarmOpts {
    SwarmOpts {
        upload: a.upload || b.upload,
        download: a.download && b.download,
    }
}

impl<S: Storage, U: UserStore> Job for DiskUsageJob<S, U> {
    fn name(&self) -> &'static str {
        "compute-user-disk-usage"
    }

    async fn run(&self) {
        // archives loaded while the users are walked are left alone
        let loaded = self.registry.list();
        let users = match self.users.list().await {
            Ok(users) => users,
            Err(err) => {
                error!("failed to list users: {err:#}");
                return;
            }
        };
        let mut owned = HashSet::new();
        let mut policies: HashMap<ArchiveKey, (u64, SwarmOpts)> = HashMap::new();
        for user in &users {
            owned.extend(user.archives.iter().copied());
            let (opts, sizes) = match self
                .reconcile_user(user)
                .instrument(error_span!("user", id = %user.id))
                .await
            {
                Ok(res) => res,
                Err(err) => {
                    warn!(user = %user.id, "skipping user: {err:#}");
                    continue;
                }
            };
            for (key, size) in sizes {
                policies
                    .entry(key)
                    .and_modify(|(_, merged)| *merged = merge_policy(*merged, opts))
                    .or_insert((size, opts));
            }
        }
        for (key, (size, opts)) in policies {
            let Some(handle) = self.registry.get(&key) else {
                continue;
            };
            handle.set_disk_usage(size);
            if let Err(err) = self.registry.swarm().apply_policy(handle, opts).await {
                warn!(key = %key.fmt_short(), "failed to apply swarm policy: {err:#}");
            }
        }
        for handle in loaded {
            let key = handle.key();
            if owned.contains(&key) {
                continue;
            }
            info!(key = %key.fmt_short(), "closing archive owned by no user");
            if let Err(err) = self.registry.close(key).await {
                warn!(key = %key.fmt_short(), "failed to close archive: {err:#}");
            }
        }
    }
}
