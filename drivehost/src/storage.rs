//! Seams to the archive storage engine.
//!
//! The engine itself is not part of the host: it is handed a [`Storage`] which creates
//! [`ArchiveStorage`] instances for a key and a directory. The host only needs a handful
//! of operations from an archive: wait for it to become ready, close it, read a small
//! metadata file, report its version and block accounting, and wrap a peer connection
//! into a [`ReplicationStream`].
//!
//! [`fs::FsStorage`] is a plain filesystem implementation.

use std::{future::Future, io, path::PathBuf};

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::key::{ArchiveKey, DiscoveryKey};

pub mod fs;

/// A bidirectional byte stream to a peer.
pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> PeerIo for T {}

/// Type erased peer connection, as handed out by a [`crate::swarm::Discovery`].
pub type BoxedIo = Box<dyn PeerIo>;

/// How a replication stream should behave towards the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateOpts {
    /// Serve our blocks to the peer.
    pub upload: bool,
    /// Fetch blocks we do not have from the peer.
    pub download: bool,
    /// Keep the stream open after the initial exchange to receive further updates.
    pub live: bool,
}

/// Block accounting of an archive, used to derive sync progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Blocks stored locally.
    pub have: u64,
    /// Blocks the archive consists of, as far as we know.
    pub needed: u64,
}

impl SyncProgress {
    /// Fraction of the archive that is available locally, in `0.0..=1.0`.
    ///
    /// An archive whose length is not known yet reports `0.0`.
    pub fn ratio(&self) -> f64 {
        if self.needed == 0 {
            return 0.0;
        }
        (self.have.min(self.needed) as f64) / (self.needed as f64)
    }
}

/// Creates archive storage for a key.
pub trait Storage: Clone + Send + Sync + 'static {
    /// The archive type produced by this storage.
    type Archive: ArchiveStorage;

    /// Open the archive stored at `path`, creating it if it does not exist yet.
    fn create(
        &self,
        path: PathBuf,
        key: ArchiveKey,
    ) -> impl Future<Output = Result<Self::Archive>> + Send;
}

/// A single archive opened by a [`Storage`].
pub trait ArchiveStorage: Send + Sync + 'static {
    /// The replication stream type.
    type Stream: ReplicationStream;

    /// The key of the archive.
    fn key(&self) -> ArchiveKey;

    /// The discovery key of the archive.
    fn discovery_key(&self) -> DiscoveryKey {
        self.key().discovery_key()
    }

    /// Resolves once the archive can be read and replicated.
    fn ready(&self) -> impl Future<Output = Result<()>> + Send;

    /// Close the archive. Closing twice is not an error.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;

    /// Wrap a peer connection into a replication stream for this archive.
    fn replicate(&self, io: BoxedIo, opts: ReplicateOpts) -> Self::Stream;

    /// Version marker of the archive; changes whenever the archive is written to.
    fn version(&self) -> u64;

    /// Read a file from the archive. Returns `None` if the file does not exist.
    fn read_file(&self, name: &str) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;

    /// Current block accounting.
    fn progress(&self) -> SyncProgress;
}

/// One replication session with a peer.
pub trait ReplicationStream: Send + 'static {
    /// Perform the protocol handshake with the peer.
    fn handshake(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Replicate until the peer goes away.
    fn run(self) -> impl Future<Output = Result<()>> + Send;
}
