//! The lock file telling other commands that a daemon owns the data directory.
//!
//! `start` writes the address it listens on to [`HostPaths::DaemonLock`] and removes the
//! file on shutdown. A lock file whose address does not accept connections is left over
//! from a crashed daemon and is removed when read.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use anyhow::{ensure, Context, Result};
use drivehost::path::HostPaths;
use tokio::{fs, net::TcpStream};
use tracing::{debug, trace};

/// How long to wait for a daemon to accept a connection before calling it dead.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
#[error("drivehost is already running on {0}")]
pub(crate) struct AlreadyRunningError(pub(crate) SocketAddr);

/// Whether a daemon is running on a data directory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum DaemonStatus {
    /// No daemon.
    Stopped,
    /// A daemon listens on this address.
    Running(SocketAddr),
}

impl DaemonStatus {
    /// Read the lock file in `root`, removing it if the daemon it names is gone.
    pub(crate) async fn load(root: impl AsRef<Path>) -> Result<Self> {
        let path = HostPaths::DaemonLock.with_root(root);
        trace!("loading daemon lock: {}", path.display());
        if !fs::try_exists(&path).await? {
            return Ok(Self::Stopped);
        }
        let content = fs::read_to_string(&path)
            .await
            .context("failed to read daemon lock file")?;
        if let Ok(addr) = content.trim().parse::<SocketAddr>() {
            if accepts_connections(addr).await {
                return Ok(Self::Running(addr));
            }
        }
        debug!("removing stale daemon lock file");
        fs::remove_file(&path)
            .await
            .context("failed to remove daemon lock file")?;
        Ok(Self::Stopped)
    }

    /// Write the lock file for a daemon listening on `addr`.
    pub(crate) async fn store(root: impl AsRef<Path>, addr: SocketAddr) -> Result<()> {
        let path = HostPaths::DaemonLock.with_root(root);
        trace!("storing daemon lock: {}", path.display());
        ensure!(!fs::try_exists(&path).await?, "drivehost is already running");
        fs::write(&path, addr.to_string())
            .await
            .context("failed to write daemon lock file")?;
        Ok(())
    }

    /// Remove the lock file, if any.
    pub(crate) async fn clear(root: impl AsRef<Path>) -> Result<()> {
        let path = HostPaths::DaemonLock.with_root(root);
        trace!("clearing daemon lock: {}", path.display());
        // ignore errors
        fs::remove_file(&path).await.ok();
        Ok(())
    }
}

/// Fail with [`AlreadyRunningError`] if a daemon is running on `root`.
pub(crate) async fn ensure_stopped(root: &Path) -> Result<()> {
    match DaemonStatus::load(root).await? {
        DaemonStatus::Stopped => Ok(()),
        DaemonStatus::Running(addr) => Err(AlreadyRunningError(addr).into()),
    }
}

async fn accepts_connections(mut addr: SocketAddr) -> bool {
    // a daemon bound to all interfaces is reached on loopback
    if addr.ip().is_unspecified() {
        let ip: IpAddr = match addr.ip() {
            IpAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
            IpAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
        };
        addr.set_ip(ip);
    }
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_daemon_lock_file() -> Result<()> {
        let dir = testdir::testdir!();
        let path = HostPaths::DaemonLock.with_root(&dir);
        assert_eq!(DaemonStatus::load(&dir).await?, DaemonStatus::Stopped);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        DaemonStatus::store(&dir, addr).await?;
        assert!(DaemonStatus::store(&dir, addr).await.is_err());
        assert_eq!(DaemonStatus::load(&dir).await?, DaemonStatus::Running(addr));
        let err = ensure_stopped(&dir).await.unwrap_err();
        assert!(err.downcast_ref::<AlreadyRunningError>().is_some());

        // the daemon died without clearing its lock
        drop(listener);
        assert_eq!(DaemonStatus::load(&dir).await?, DaemonStatus::Stopped);
        assert!(!fs::try_exists(&path).await?);
        ensure_stopped(&dir).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_unspecified_addr_checked_on_loopback() -> Result<()> {
        let dir = testdir::testdir!();
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        DaemonStatus::store(&dir, addr).await?;
        assert_eq!(DaemonStatus::load(&dir).await?, DaemonStatus::Running(addr));

        DaemonStatus::clear(&dir).await?;
        assert_eq!(DaemonStatus::load(&dir).await?, DaemonStatus::Stopped);
        Ok(())
    }
}
