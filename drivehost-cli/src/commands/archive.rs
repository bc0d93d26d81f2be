//! Commands working on the archives in the data directory while no host runs.

use std::{fmt, path::Path};

use anyhow::{bail, Result};
use colored::Colorize;
use drivehost::{
    manifest::{read_manifest, MANIFEST_FILE},
    path::{archive_dir, ensure_archive_dir},
    storage::{fs::FsArchive, ArchiveStorage, SyncProgress},
    user::{FsUserStore, UserRecord, UserStore},
    util::dir_size,
    ArchiveKey, Manifest,
};
use tracing::debug;

/// Create a new archive owned by `user` and return its key.
///
/// The user is created with `quota` if it does not exist yet.
pub(crate) async fn create(
    data_dir: &Path,
    users: &FsUserStore,
    user: &str,
    title: Option<String>,
    quota: Option<u64>,
) -> Result<ArchiveKey> {
    let known = users.list().await?.into_iter().any(|u| u.id == user);
    if !known {
        let Some(quota) = quota else {
            bail!("unknown user {user}, pass --quota to create it");
        };
        users.upsert(UserRecord::new(user, quota)).await?;
    }

    let key = ArchiveKey::generate();
    let dir = ensure_archive_dir(data_dir, &key).await?;
    let archive = FsArchive::open(dir, key).await?;
    let manifest = Manifest {
        title,
        ..Default::default()
    };
    archive
        .write_file(MANIFEST_FILE, &serde_json::to_vec_pretty(&manifest)?)
        .await?;
    archive.close().await?;
    users.add_archive(user, key).await?;
    debug!(key = %key.fmt_short(), user, "created archive");
    Ok(key)
}

/// State of a stored archive.
#[derive(Debug, Clone)]
pub(crate) struct ArchiveStatus {
    pub(crate) key: ArchiveKey,
    pub(crate) manifest: Option<Manifest>,
    pub(crate) version: u64,
    pub(crate) progress: SyncProgress,
    pub(crate) size: u64,
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", "archive".green(), self.key)?;
        if let Some(title) = self.manifest.as_ref().and_then(|m| m.title.as_deref()) {
            writeln!(f, "title:    {title}")?;
        }
        writeln!(f, "version:  {}", self.version)?;
        writeln!(
            f,
            "synced:   {:.1}% ({}/{} blocks)",
            self.progress.ratio() * 100.0,
            self.progress.have,
            self.progress.needed
        )?;
        write!(f, "size:     {} bytes", self.size)
    }
}

/// Read the status of the archive with `key` from the data directory.
pub(crate) async fn status(data_dir: &Path, key: ArchiveKey) -> Result<ArchiveStatus> {
    let dir = archive_dir(data_dir, &key);
    if !tokio::fs::try_exists(&dir).await? {
        bail!("archive {key} is not stored in {}", data_dir.display());
    }
    let archive = FsArchive::open(dir.clone(), key).await?;
    let manifest = read_manifest(&archive).await?;
    let status = ArchiveStatus {
        key,
        manifest,
        version: archive.version(),
        progress: archive.progress(),
        size: dir_size(dir).await?,
    };
    archive.close().await?;
    Ok(status)
}
