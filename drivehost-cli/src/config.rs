//! Configuration for the drivehost CLI.

use std::{
    env,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{anyhow, ensure, Result};
use drivehost::{
    jobs::{DEFAULT_DISK_USAGE_INTERVAL, DEFAULT_POPULAR_INTERVAL, DEFAULT_POPULAR_MAX},
    user::UserRecord,
    ArchiveKey, Options,
};
use serde::Deserialize;

const ENV_CONFIG_DIR: &str = "DRIVEHOST_CONFIG_DIR";
const ENV_DATA_DIR: &str = "DRIVEHOST_DATA_DIR";
const ENV_FILE_RUST_LOG: &str = "DRIVEHOST_FILE_RUST_LOG";

/// Name of the optional config file located in the drivehost config directory.
pub(crate) const CONFIG_FILE_NAME: &str = "drivehost.config.toml";

/// Port the swarm listens on unless configured otherwise.
pub(crate) const DEFAULT_PORT: u16 = 3282;

/// The configuration for a drivehost daemon.
#[derive(PartialEq, Eq, Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct HostConfig {
    /// Address the swarm listens on.
    pub(crate) listen_addr: SocketAddr,
    /// Peers dialed for every archive.
    pub(crate) peers: Vec<SocketAddr>,
    /// Length of the popularity index.
    pub(crate) popular_max: usize,
    /// Intervals of the background jobs.
    pub(crate) jobs: JobsConfig,
    /// Configuration for the logfile.
    pub(crate) file_logs: super::logging::FileLogging,
    /// Users written to a fresh user file.
    pub(crate) users: Vec<UserConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addr: (Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
            peers: Vec::new(),
            popular_max: DEFAULT_POPULAR_MAX,
            jobs: JobsConfig::default(),
            file_logs: Default::default(),
            users: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Creates a config from default config file.
    ///
    /// If the *file* is `Some` the configuration will be read from it.  Otherwise the
    /// default config file will be loaded.  If that is not present the default config will
    /// be used.
    pub(crate) async fn load(file: Option<&Path>) -> Result<HostConfig> {
        let default_config = drivehost_config_path(CONFIG_FILE_NAME)?;

        let config_file = match file {
            Some(file) => Some(file),
            None => {
                if default_config.exists() {
                    Some(default_config.as_ref())
                } else {
                    None
                }
            }
        };
        let mut config = if let Some(file) = config_file {
            let config = tokio::fs::read_to_string(file).await?;
            Self::load_toml(&config)?
        } else {
            Self::default()
        };

        // override from env var
        if let Some(env_filter) = env_file_rust_log().transpose()? {
            config.file_logs.rust_log = env_filter;
        }
        Ok(config)
    }

    fn load_toml(s: &str) -> Result<HostConfig> {
        let config: HostConfig = toml::from_str(s)?;
        ensure!(
            config.jobs.popular_interval_secs > 0 && config.jobs.disk_usage_interval_secs > 0,
            "job intervals must be at least one second"
        );
        Ok(config)
    }

    /// Host options for archives stored in `data_dir`.
    pub(crate) fn host_options(&self, data_dir: &Path) -> Options {
        Options {
            data_dir: data_dir.to_path_buf(),
            popular_max: self.popular_max,
            popular_interval: Duration::from_secs(self.jobs.popular_interval_secs),
            disk_usage_interval: Duration::from_secs(self.jobs.disk_usage_interval_secs),
        }
    }
}

/// Intervals of the background jobs, in seconds.
#[derive(PartialEq, Eq, Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct JobsConfig {
    pub(crate) popular_interval_secs: u64,
    pub(crate) disk_usage_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            popular_interval_secs: DEFAULT_POPULAR_INTERVAL.as_secs(),
            disk_usage_interval_secs: DEFAULT_DISK_USAGE_INTERVAL.as_secs(),
        }
    }
}

/// A user as written in the config file.
#[derive(PartialEq, Eq, Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct UserConfig {
    pub(crate) id: String,
    /// Quota in bytes.
    pub(crate) disk_quota: u64,
    #[serde(default)]
    pub(crate) archives: Vec<ArchiveKey>,
}

impl From<UserConfig> for UserRecord {
    fn from(source: UserConfig) -> Self {
        UserRecord {
            archives: source.archives,
            ..UserRecord::new(source.id, source.disk_quota)
        }
    }
}

/// Parse [`ENV_FILE_RUST_LOG`] as [`tracing_subscriber::EnvFilter`]. Returns `None` if not
/// present.
fn env_file_rust_log() -> Option<Result<crate::logging::LogFilter>> {
    match env::var(ENV_FILE_RUST_LOG) {
        Ok(s) => Some(crate::logging::LogFilter::from_str(&s).map_err(Into::into)),
        Err(e) => match e {
            env::VarError::NotPresent => None,
            e @ env::VarError::NotUnicode(_) => Some(Err(e.into())),
        },
    }
}

/// Name of directory that wraps all drivehost files in a given application directory
const DRIVEHOST_DIR: &str = "drivehost";

/// Returns the path to the user's drivehost config directory.
///
/// If the `DRIVEHOST_CONFIG_DIR` environment variable is set it will be used
/// unconditionally. Otherwise the operating system's config directory is used, e.g.
/// `$XDG_CONFIG_HOME/drivehost` on Linux.
pub(crate) fn drivehost_config_root() -> Result<PathBuf> {
    if let Some(val) = env::var_os(ENV_CONFIG_DIR) {
        return Ok(PathBuf::from(val));
    }
    let cfg = dirs_next::config_dir()
        .ok_or_else(|| anyhow!("operating environment provides no directory for configuration"))?;
    Ok(cfg.join(DRIVEHOST_DIR))
}

/// Path that leads to a file in the drivehost config directory.
pub(crate) fn drivehost_config_path(file_name: impl AsRef<Path>) -> Result<PathBuf> {
    let path = drivehost_config_root()?.join(file_name);
    Ok(path)
}

/// Returns the path to the user's drivehost data directory.
///
/// If the `DRIVEHOST_DATA_DIR` environment variable is set it will be used unconditionally.
/// Otherwise the operating system's data directory is used, e.g.
/// `$XDG_DATA_HOME/drivehost` on Linux. Relative paths are made absolute.
pub(crate) fn drivehost_data_root() -> Result<PathBuf> {
    let path = if let Some(val) = env::var_os(ENV_DATA_DIR) {
        PathBuf::from(val)
    } else {
        let path = dirs_next::data_dir().ok_or_else(|| {
            anyhow!("operating environment provides no directory for application data")
        })?;
        path.join(DRIVEHOST_DIR)
    };
    let path = if !path.is_absolute() {
        std::env::current_dir()?.join(path)
    } else {
        path
    };
    Ok(path)
}
