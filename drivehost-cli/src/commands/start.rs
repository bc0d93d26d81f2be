use std::{net::SocketAddr, path::Path};

use anyhow::Result;
use colored::Colorize;
use drivehost::{net::TcpSwarm, storage::fs::FsStorage, Host};
use tracing::{info, info_span, Instrument};

use crate::{
    commands::{
        daemon::{ensure_stopped, AlreadyRunningError, DaemonStatus},
        open_users,
    },
    config::HostConfig,
};

/// Run the host until Ctrl-C is pressed.
///
/// All archives owned by a user are loaded on startup. While running, the data directory
/// is claimed with a [`DaemonStatus`] lock file.
pub(crate) async fn run(
    config: &HostConfig,
    data_dir: &Path,
    addr: Option<SocketAddr>,
) -> Result<()> {
    let res = run_daemon(config, data_dir, addr).await;
    match res {
        // the lock belongs to the other daemon
        Err(err) if err.is::<AlreadyRunningError>() => Err(err),
        res => {
            DaemonStatus::clear(data_dir).await?;
            res
        }
    }
}

async fn run_daemon(
    config: &HostConfig,
    data_dir: &Path,
    addr: Option<SocketAddr>,
) -> Result<()> {
    ensure_stopped(data_dir).await?;
    let users = open_users(data_dir, config).await?;
    let swarm = TcpSwarm::bind(addr.unwrap_or(config.listen_addr), config.peers.clone()).await?;
    let local_addr = swarm.local_addr();
    DaemonStatus::store(data_dir, local_addr).await?;
    let host = Host::spawn(FsStorage, swarm, users, config.host_options(data_dir)).await?;
    eprintln!("{}", welcome_message(local_addr, data_dir, config));

    let res = tokio::select! {
        biased;
        _ = tokio::signal::ctrl_c() => Ok(()),
        res = async {
            let loaded = host.resume().await?;
            eprintln!("Serving {loaded} archives");
            tokio::signal::ctrl_c().await?;
            anyhow::Ok(())
        }.instrument(info_span!("resume")) => res,
    };

    info!("shutting down");
    let shutdown = host.shutdown().await;
    res.and(shutdown)
}

fn welcome_message(local_addr: SocketAddr, data_dir: &Path, config: &HostConfig) -> String {
    format!(
        "{}\nListening on: {}\nData directory: {}\nPeers: {}\n",
        "drivehost is running".green(),
        local_addr,
        data_dir.display(),
        config.peers.len(),
    )
}
