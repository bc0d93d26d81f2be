use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use drivehost::{
    path::HostPaths,
    user::{FsUserStore, UserStore},
    ArchiveKey,
};
use tracing::info;

use crate::config::HostConfig;

pub(crate) mod archive;
pub(crate) mod daemon;
pub(crate) mod start;

/// Host archives for many users and replicate them with peers.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,

    /// Config file to load. Defaults to `drivehost.config.toml` in the config directory.
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Commands {
    /// Run the host until stopped with Ctrl-C.
    Start {
        /// Address to listen on, overriding the config file.
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Create a new archive owned by a user.
    ///
    /// Works on the data directory directly, so the daemon must not be running.
    Create {
        /// Owner of the archive.
        #[arg(long)]
        user: String,
        /// Title written to the archive metadata.
        #[arg(long)]
        title: Option<String>,
        /// Quota in bytes, required when the user does not exist yet.
        #[arg(long)]
        quota: Option<u64>,
    },
    /// List users with their quota and disk usage.
    Users,
    /// Show metadata, sync progress and size of a stored archive.
    Status {
        /// Key of the archive, hex encoded.
        key: ArchiveKey,
    },
}

impl Cli {
    pub(crate) async fn run(self, data_dir: &Path) -> Result<()> {
        let config = HostConfig::load(self.config.as_deref()).await?;
        match self.command {
            Commands::Start { addr } => {
                let logs_dir = HostPaths::Logs.with_root(data_dir);
                tokio::fs::create_dir_all(&logs_dir)
                    .await
                    .with_context(|| format!("failed to create {}", logs_dir.display()))?;
                let _guard =
                    crate::logging::init_terminal_and_file_logging(&config.file_logs, &logs_dir)?;
                start::run(&config, data_dir, addr).await
            }
            Commands::Create { user, title, quota } => {
                crate::logging::init_terminal_logging()?;
                let key = create_archive(data_dir, &config, &user, title, quota).await?;
                println!("{key}");
                Ok(())
            }
            Commands::Users => {
                crate::logging::init_terminal_logging()?;
                let users = open_users(data_dir, &config).await?;
                print_users(&users).await
            }
            Commands::Status { key } => {
                crate::logging::init_terminal_logging()?;
                let status = archive::status(data_dir, key).await?;
                println!("{status}");
                Ok(())
            }
        }
    }
}

/// Create an archive for `user`, refusing while a daemon owns `data_dir`.
async fn create_archive(
    data_dir: &Path,
    config: &HostConfig,
    user: &str,
    title: Option<String>,
    quota: Option<u64>,
) -> Result<ArchiveKey> {
    daemon::ensure_stopped(data_dir)
        .await
        .context("stop drivehost before creating archives")?;
    let users = open_users(data_dir, config).await?;
    archive::create(data_dir, &users, user, title, quota).await
}

/// Open the user file in `data_dir`, seeding it with the configured users if it does not
/// exist yet.
pub(crate) async fn open_users(data_dir: &Path, config: &HostConfig) -> Result<FsUserStore> {
    let store = FsUserStore::new(HostPaths::Users.with_root(data_dir));
    if tokio::fs::try_exists(store.path()).await? {
        return Ok(store);
    }
    tokio::fs::create_dir_all(data_dir).await?;
    for user in config.users.iter().cloned() {
        store.upsert(user.into()).await?;
    }
    info!(
        users = config.users.len(),
        path = %store.path().display(),
        "seeded user file from config"
    );
    Ok(store)
}

async fn print_users(users: &FsUserStore) -> Result<()> {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "user",
        "archives",
        "disk quota",
        "disk usage",
        "used",
    ]);
    for user in users.list().await? {
        let used = if user.disk_quota == 0 {
            "-".to_string()
        } else {
            format!(
                "{:.1}%",
                user.disk_usage as f64 / user.disk_quota as f64 * 100.0
            )
        };
        table.add_row(vec![
            user.id.clone(),
            user.archives.len().to_string(),
            user.disk_quota.to_string(),
            user.disk_usage.to_string(),
            used,
        ]);
    }
    println!("{table}");
    Ok(())
}
