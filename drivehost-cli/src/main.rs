//! The `drivehost` binary: hosts archives for a set of users and replicates them with peers.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

mod commands;
mod config;
mod logging;

use crate::commands::Cli;

/// How long blocking tasks, such as a disk usage walk, may delay exiting.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("drivehost")
        .worker_threads(2)
        .enable_all()
        .build()?;
    let res = rt.block_on(async {
        let data_dir = config::drivehost_data_root()?;
        Cli::parse().run(&data_dir).await
    });
    rt.shutdown_timeout(SHUTDOWN_GRACE);
    res
}
