//! Paths to files and directories inside the host's data directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::key::ArchiveKey;

/// Paths to files or directories used by the host.
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum::AsRefStr, strum::EnumString, strum::Display)]
#[cfg_attr(test, derive(strum::EnumIter))]
pub enum HostPaths {
    /// Root of the sharded archive storage.
    #[strum(serialize = "archives")]
    Archives,
    /// Path to the [`crate::user::FsUserStore`] database.
    #[strum(serialize = "users.json")]
    Users,
    /// Directory for rolling log files.
    #[strum(serialize = "logs")]
    Logs,
    /// Address of the running daemon, present while it runs.
    #[strum(serialize = "daemon.lock")]
    DaemonLock,
}

impl AsRef<Path> for HostPaths {
    fn as_ref(&self) -> &Path {
        let s: &str = self.as_ref();
        Path::new(s)
    }
}

impl HostPaths {
    /// Get the path for this [`HostPaths`] by joining the name to a root directory.
    pub fn with_root(self, root: impl AsRef<Path>) -> PathBuf {
        root.as_ref().join(self)
    }
}

/// Directory holding the storage of the archive with `key`.
///
/// Sharded by the first byte of the key: `<root>/archives/<hex[0..2]>/<hex[2..]>`.
pub fn archive_dir(root: impl AsRef<Path>, key: &ArchiveKey) -> PathBuf {
    let hex = key.to_hex();
    let (shard, rest) = hex.split_at(2);
    HostPaths::Archives.with_root(root).join(shard).join(rest)
}

/// Resolve the archive directory for `key` and create it if it is missing.
pub async fn ensure_archive_dir(root: impl AsRef<Path>, key: &ArchiveKey) -> Result<PathBuf> {
    let dir = archive_dir(root, key);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create archive directory {}", dir.display()))?;
    Ok(dir)
}
