//! Filesystem backed archive storage.
//!
//! Layout of an archive directory:
//!
//! - `key`: hex encoded archive key, written on creation and checked on every open.
//! - `version`: number of writes the archive has seen.
//! - `content/`: the files of the archive.
//!
//! Replication streams exchange a fixed size header (magic, discovery key, flags) as their
//! handshake and are then held open until the peer hangs up.

use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::{ArchiveStorage, BoxedIo, ReplicateOpts, ReplicationStream, Storage, SyncProgress};
use crate::key::{ArchiveKey, DiscoveryKey, KEY_LEN};

const KEY_FILE: &str = "key";
const VERSION_FILE: &str = "version";
const CONTENT_DIR: &str = "content";

const HEADER_MAGIC: [u8; 4] = *b"DHv1";
const HEADER_LEN: usize = HEADER_MAGIC.len() + KEY_LEN + 1;
const FLAG_UPLOAD: u8 = 0b01;
const FLAG_DOWNLOAD: u8 = 0b10;

/// [`Storage`] that keeps every archive in a plain directory.
#[derive(Debug, Clone, Default)]
pub struct FsStorage;

impl Storage for FsStorage {
    type Archive = FsArchive;

    async fn create(&self, path: PathBuf, key: ArchiveKey) -> Result<FsArchive> {
        FsArchive::open(path, key).await
    }
}

/// An archive stored in a directory.
#[derive(Debug)]
pub struct FsArchive {
    key: ArchiveKey,
    path: PathBuf,
    version: AtomicU64,
    closed: AtomicBool,
    write_lock: tokio::sync::Mutex<()>,
}

impl FsArchive {
    /// Open the archive in `path`, creating it if the directory holds no archive yet.
    ///
    /// Fails if the directory holds an archive with a different key.
    pub async fn open(path: PathBuf, key: ArchiveKey) -> Result<Self> {
        let content = path.join(CONTENT_DIR);
        tokio::fs::create_dir_all(&content)
            .await
            .with_context(|| format!("failed to create {}", content.display()))?;

        let key_path = path.join(KEY_FILE);
        match tokio::fs::read_to_string(&key_path).await {
            Ok(stored) => {
                let stored: ArchiveKey = stored
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid key file {}", key_path.display()))?;
                ensure!(
                    stored == key,
                    "archive in {} has key {}, expected {}",
                    path.display(),
                    stored.fmt_short(),
                    key.fmt_short()
                );
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(key = %key.fmt_short(), "creating new archive");
                tokio::fs::write(&key_path, key.to_hex()).await?;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", key_path.display()))
            }
        }

        let version_path = path.join(VERSION_FILE);
        let version = match tokio::fs::read_to_string(&version_path).await {
            Ok(s) => s
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid version file {}", version_path.display()))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", version_path.display()))
            }
        };

        Ok(Self {
            key,
            path,
            version: AtomicU64::new(version),
            closed: AtomicBool::new(false),
            write_lock: Default::default(),
        })
    }

    /// Directory of the archive.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a file into the archive, returning the new version.
    pub async fn write_file(&self, name: &str, data: &[u8]) -> Result<u64> {
        let file = self.content_path(name)?;
        let _guard = self.write_lock.lock().await;
        ensure!(
            !self.closed.load(Ordering::SeqCst),
            "archive {} is closed",
            self.key.fmt_short()
        );
        tokio::fs::write(&file, data)
            .await
            .with_context(|| format!("failed to write {}", file.display()))?;
        let version = self.version.load(Ordering::SeqCst) + 1;
        tokio::fs::write(self.path.join(VERSION_FILE), version.to_string()).await?;
        self.version.store(version, Ordering::SeqCst);
        Ok(version)
    }

    fn content_path(&self, name: &str) -> io::Result<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid file name {name:?}"),
            ));
        }
        Ok(self.path.join(CONTENT_DIR).join(name))
    }
}

impl ArchiveStorage for FsArchive {
    type Stream = FsReplicationStream;

    fn key(&self) -> ArchiveKey {
        self.key
    }

    async fn ready(&self) -> Result<()> {
        ensure!(
            !self.closed.load(Ordering::SeqCst),
            "archive {} is closed",
            self.key.fmt_short()
        );
        let content = self.path.join(CONTENT_DIR);
        let meta = tokio::fs::metadata(&content)
            .await
            .with_context(|| format!("missing content directory {}", content.display()))?;
        ensure!(meta.is_dir(), "{} is not a directory", content.display());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        // wait for a write in progress
        let _guard = self.write_lock.lock().await;
        Ok(())
    }

    fn replicate(&self, io: BoxedIo, opts: ReplicateOpts) -> FsReplicationStream {
        FsReplicationStream {
            io,
            discovery_key: self.discovery_key(),
            opts,
            remote: None,
        }
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    async fn read_file(&self, name: &str) -> io::Result<Option<Bytes>> {
        let file = self.content_path(name)?;
        match tokio::fs::read(&file).await {
            Ok(data) => Ok(Some(data.into())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn progress(&self) -> SyncProgress {
        // everything written through this storage is local
        let blocks = self.version();
        SyncProgress {
            have: blocks,
            needed: blocks,
        }
    }
}

/// Replication stream of a [`FsArchive`].
#[derive(derive_more::Debug)]
pub struct FsReplicationStream {
    #[debug("BoxedIo")]
    io: BoxedIo,
    discovery_key: DiscoveryKey,
    opts: ReplicateOpts,
    remote: Option<ReplicateOpts>,
}

impl FsReplicationStream {
    /// Options announced by the remote peer, once the handshake completed.
    pub fn remote_opts(&self) -> Option<ReplicateOpts> {
        self.remote
    }
}

impl ReplicationStream for FsReplicationStream {
    async fn handshake(&mut self) -> Result<()> {
        let header = encode_header(&self.discovery_key, &self.opts);
        self.io.write_all(&header).await?;
        self.io.flush().await?;
        let mut buf = [0u8; HEADER_LEN];
        self.io
            .read_exact(&mut buf)
            .await
            .context("peer closed before handshake")?;
        let remote = decode_header(&buf, &self.discovery_key)?;
        trace!(?remote, "handshake complete");
        self.remote = Some(remote);
        Ok(())
    }

    async fn run(mut self) -> Result<()> {
        if !self.opts.live {
            self.io.shutdown().await.ok();
            return Ok(());
        }
        let mut buf = [0u8; 1024];
        loop {
            let n = self.io.read(&mut buf).await?;
            if n == 0 {
                break;
            }
        }
        Ok(())
    }
}

fn encode_header(discovery_key: &DiscoveryKey, opts: &ReplicateOpts) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&HEADER_MAGIC);
    header[4..4 + KEY_LEN].copy_from_slice(discovery_key.as_bytes());
    let mut flags = 0;
    if opts.upload {
        flags |= FLAG_UPLOAD;
    }
    if opts.download {
        flags |= FLAG_DOWNLOAD;
    }
    header[HEADER_LEN - 1] = flags;
    header
}

fn decode_header(header: &[u8; HEADER_LEN], expected: &DiscoveryKey) -> Result<ReplicateOpts> {
    ensure!(header[..4] == HEADER_MAGIC, "invalid handshake magic");
    ensure!(
        &header[4..4 + KEY_LEN] == expected.as_bytes(),
        "peer replicates a different archive"
    );
    let flags = header[HEADER_LEN - 1];
    Ok(ReplicateOpts {
        upload: flags & FLAG_UPLOAD != 0,
        download: flags & FLAG_DOWNLOAD != 0,
        live: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTS: ReplicateOpts = ReplicateOpts {
        upload: true,
        download: false,
        live: true,
    };

    #[tokio::test]
    async fn test_open_persists_version() -> Result<()> {
        let dir = testdir::testdir!();
        let key = ArchiveKey::generate();
        let archive = FsArchive::open(dir.clone(), key).await?;
        archive.ready().await?;
        assert_eq!(archive.version(), 0);
        assert_eq!(archive.write_file("a.txt", b"hello").await?, 1);
        assert_eq!(archive.write_file("b.txt", b"world").await?, 2);
        archive.close().await?;
        assert!(archive.ready().await.is_err());
        assert!(archive.write_file("c.txt", b"!").await.is_err());

        let archive = FsArchive::open(dir, key).await?;
        assert_eq!(archive.version(), 2);
        assert_eq!(
            archive.read_file("a.txt").await?,
            Some(Bytes::from_static(b"hello"))
        );
        assert_eq!(archive.read_file("missing").await?, None);
        assert_eq!(archive.progress().ratio(), 1.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_open_rejects_other_key() -> Result<()> {
        let dir = testdir::testdir!();
        FsArchive::open(dir.clone(), ArchiveKey::generate()).await?;
        assert!(FsArchive::open(dir, ArchiveKey::generate()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_file_names() -> Result<()> {
        let dir = testdir::testdir!();
        let archive = FsArchive::open(dir, ArchiveKey::generate()).await?;
        assert!(archive.write_file("../escape", b"x").await.is_err());
        assert!(archive.read_file("").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_handshake() -> Result<()> {
        let dir = testdir::testdir!();
        let key = ArchiveKey::generate();
        let a = FsArchive::open(dir.join("a"), key).await?;
        let b = FsArchive::open(dir.join("b"), key).await?;
        let (io_a, io_b) = tokio::io::duplex(1024);
        let mut stream_a = a.replicate(Box::new(io_a), OPTS);
        let mut stream_b = b.replicate(
            Box::new(io_b),
            ReplicateOpts {
                download: true,
                ..OPTS
            },
        );
        let (res_a, res_b) = tokio::join!(stream_a.handshake(), stream_b.handshake());
        res_a?;
        res_b?;
        assert_eq!(stream_a.remote_opts().map(|o| o.download), Some(true));
        assert_eq!(stream_b.remote_opts().map(|o| o.download), Some(false));

        // dropping one side ends the other
        drop(stream_b);
        stream_a.run().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_handshake_wrong_archive() -> Result<()> {
        let dir = testdir::testdir!();
        let a = FsArchive::open(dir.join("a"), ArchiveKey::generate()).await?;
        let b = FsArchive::open(dir.join("b"), ArchiveKey::generate()).await?;
        let (io_a, io_b) = tokio::io::duplex(1024);
        let mut stream_a = a.replicate(Box::new(io_a), OPTS);
        let mut stream_b = b.replicate(Box::new(io_b), OPTS);
        let (res_a, res_b) = tokio::join!(stream_a.handshake(), stream_b.handshake());
        assert!(res_a.is_err());
        assert!(res_b.is_err());
        Ok(())
    }
}
