//! Users owning archives, and where their records are kept.
//!
//! The host only reads which archives a user owns and their quota, and writes back the
//! disk usage computed by [`crate::jobs::DiskUsageJob`]. Everything else about users
//! lives outside of the host.

use std::{
    collections::BTreeMap,
    future::Future,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::key::ArchiveKey;

/// Storage accounting of a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Identifier of the user.
    pub id: String,
    /// Archives owned by the user.
    #[serde(default)]
    pub archives: Vec<ArchiveKey>,
    /// Quota in bytes.
    #[serde(default)]
    pub disk_quota: u64,
    /// Bytes used as of the last disk usage run.
    #[serde(default)]
    pub disk_usage: u64,
}

impl UserRecord {
    /// A user without archives.
    pub fn new(id: impl Into<String>, disk_quota: u64) -> Self {
        Self {
            id: id.into(),
            disk_quota,
            ..Default::default()
        }
    }
}

/// Access to the user records.
pub trait UserStore: Send + Sync + 'static {
    /// All users.
    fn list(&self) -> impl Future<Output = Result<Vec<UserRecord>>> + Send;

    /// Persist the computed disk usage of a user.
    fn update_disk_usage(&self, id: &str, bytes: u64) -> impl Future<Output = Result<()>> + Send;
}

/// In memory [`UserStore`].
#[derive(Debug, Clone, Default)]
pub struct MemUserStore {
    users: Arc<RwLock<BTreeMap<String, UserRecord>>>,
}

impl MemUserStore {
    /// Insert or replace a user.
    pub fn insert(&self, user: UserRecord) {
        self.users.write().insert(user.id.clone(), user);
    }

    /// Get a user.
    pub fn get(&self, id: &str) -> Option<UserRecord> {
        self.users.read().get(id).cloned()
    }

    /// Add an archive to a user, creating the user with a zero quota if it does not exist.
    pub fn add_archive(&self, id: &str, key: ArchiveKey) {
        let mut users = self.users.write();
        let user = users
            .entry(id.to_string())
            .or_insert_with(|| UserRecord::new(id, 0));
        if !user.archives.contains(&key) {
            user.archives.push(key);
        }
    }
}

impl UserStore for MemUserStore {
    async fn list(&self) -> Result<Vec<UserRecord>> {
        Ok(self.users.read().values().cloned().collect())
    }

    async fn update_disk_usage(&self, id: &str, bytes: u64) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(id)
            .with_context(|| format!("unknown user {id}"))?;
        user.disk_usage = bytes;
        Ok(())
    }
}

/// [`UserStore`] kept in a JSON file.
///
/// The file is rewritten completely on every change, through a temporary file that is
/// renamed over the old one.
#[derive(Debug, Clone)]
pub struct FsUserStore {
    path: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl FsUserStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Default::default(),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace a user.
    pub async fn upsert(&self, user: UserRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut users = self.read().await?;
        match users.iter_mut().find(|u| u.id == user.id) {
            Some(existing) => *existing = user,
            None => users.push(user),
        }
        self.write(users).await
    }

    /// Add an archive to an existing user.
    pub async fn add_archive(&self, id: &str, key: ArchiveKey) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut users = self.read().await?;
        let user = users
            .iter_mut()
            .find(|u| u.id == id)
            .with_context(|| format!("unknown user {id}"))?;
        if !user.archives.contains(&key) {
            user.archives.push(key);
        }
        self.write(users).await
    }

    async fn read(&self) -> Result<Vec<UserRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("invalid user file {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }

    async fn write(&self, users: Vec<UserRecord>) -> Result<()> {
        let path = self.path.clone();
        let data = serde_json::to_vec_pretty(&users)?;
        tokio::task::spawn_blocking(move || write_atomic(&path, &data)).await??;
        debug!(path = %self.path.display(), users = users.len(), "wrote user file");
        Ok(())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

impl UserStore for FsUserStore {
    async fn list(&self) -> Result<Vec<UserRecord>> {
        self.read().await
    }

    async fn update_disk_usage(&self, id: &str, bytes: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut users = self.read().await?;
        let user = users
            .iter_mut()
            .find(|u| u.id == id)
            .with_context(|| format!("unknown user {id}"))?;
        if user.disk_usage == bytes {
            return Ok(());
        }
        user.disk_usage = bytes;
        self.write(users).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_store() -> Result<()> {
        let store = MemUserStore::default();
        let key = ArchiveKey::generate();
        store.add_archive("alice", key);
        store.add_archive("alice", key);
        store.update_disk_usage("alice", 42).await?;
        assert!(store.update_disk_usage("bob", 1).await.is_err());

        let users = store.list().await?;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].archives, vec![key]);
        assert_eq!(users[0].disk_usage, 42);
        Ok(())
    }

    #[tokio::test]
    async fn test_fs_store() -> Result<()> {
        let dir = testdir::testdir!();
        let store = FsUserStore::new(dir.join("users.json"));
        assert!(store.list().await?.is_empty());

        let key = ArchiveKey::generate();
        store.upsert(UserRecord::new("alice", 1000)).await?;
        store.add_archive("alice", key).await?;
        store.update_disk_usage("alice", 200).await?;
        assert!(store.add_archive("bob", key).await.is_err());

        // reopen
        let store = FsUserStore::new(dir.join("users.json"));
        let users = store.list().await?;
        assert_eq!(
            users,
            vec![UserRecord {
                id: "alice".into(),
                archives: vec![key],
                disk_quota: 1000,
                disk_usage: 200,
            }]
        );
        Ok(())
    }

    #[test]
    fn test_record_keys_as_hex() -> Result<()> {
        let key = ArchiveKey::from_bytes([1u8; 32]);
        let json = format!(r#"{{"id":"carol","archives":["{}"],"disk_quota":5}}"#, key);
        let user: UserRecord = serde_json::from_str(&json)?;
        assert_eq!(user.archives, vec![key]);
        assert_eq!(user.disk_usage, 0);
        Ok(())
    }
}
