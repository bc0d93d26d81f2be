//! Log output of the host.
//!
//! Every command logs to stderr, filtered by `RUST_LOG`. The long running `start` command
//! also writes rolling log files below the data directory, filtered by its own directive
//! from the configuration so a daemon can keep debug logs without flooding the terminal.

use std::{num::NonZeroUsize, path::Path, str::FromStr};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use tracing::Subscriber;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, Layer,
};

/// Prefix of the rolling log files, followed by the rotation period.
const LOG_FILE_PREFIX: &str = "drivehost";

/// Log files kept unless configured otherwise.
const DEFAULT_MAX_FILES: NonZeroUsize = match NonZeroUsize::new(8) {
    Some(n) => n,
    None => unreachable!(),
};

/// Log to stderr and to rolling files in `logs_dir`.
///
/// Files are named `drivehost.<period>.log`, carry line numbers and no colors. Dropping
/// the returned guard flushes what is still buffered for the files.
pub(crate) fn init_terminal_and_file_logging(
    config: &FileLogging,
    logs_dir: &Path,
) -> Result<non_blocking::WorkerGuard> {
    let (writer, guard) = non_blocking(config.appender(logs_dir)?);
    let file_layer = fmt::Layer::new()
        .with_ansi(false)
        .with_line_number(true)
        .with_writer(writer)
        .with_filter(config.rust_log.to_filter());
    tracing_subscriber::registry()
        .with(file_layer)
        .with(terminal_layer())
        .try_init()?;
    Ok(guard)
}

/// Log to stderr only, for the short lived commands.
pub(crate) fn init_terminal_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(terminal_layer())
        .try_init()?;
    Ok(())
}

fn terminal_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::EnvFilter::from_default_env())
}

/// The `[file_logs]` section of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct FileLogging {
    /// Filter directive for the log files, in `RUST_LOG` syntax.
    pub(crate) rust_log: LogFilter,
    /// Log files kept, older ones are deleted.
    pub(crate) max_files: NonZeroUsize,
    /// When to start a new log file.
    pub(crate) rotation: Rotation,
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            rust_log: LogFilter::default(),
            max_files: DEFAULT_MAX_FILES,
            rotation: Rotation::default(),
        }
    }
}

impl FileLogging {
    fn appender(&self, logs_dir: &Path) -> Result<rolling::RollingFileAppender> {
        rolling::Builder::new()
            .rotation(self.rotation.into())
            .max_log_files(self.max_files.get())
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("log")
            .build(logs_dir)
            .with_context(|| format!("failed to open log files in {}", logs_dir.display()))
    }
}

/// A `RUST_LOG` directive, checked when parsed.
///
/// [`tracing_subscriber::EnvFilter`] is neither `Clone` nor comparable, so the directive
/// is kept as text and turned into a filter when the subscriber is built.
#[derive(
    Debug, Clone, PartialEq, Eq, SerializeDisplay, DeserializeFromStr, derive_more::Display,
)]
#[display("{_0}")]
pub(crate) struct LogFilter(String);

impl FromStr for LogFilter {
    type Err = <tracing_subscriber::EnvFilter as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        tracing_subscriber::EnvFilter::try_new(s)?;
        Ok(Self(s.to_string()))
    }
}

impl Default for LogFilter {
    fn default() -> Self {
        Self("info,drivehost=debug".into())
    }
}

impl LogFilter {
    fn to_filter(&self) -> tracing_subscriber::EnvFilter {
        // parsed before, so this never falls back
        tracing_subscriber::EnvFilter::try_new(&self.0)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    }
}

/// When a new log file is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Rotation {
    #[default]
    Hourly,
    Daily,
    Never,
}

impl From<Rotation> for rolling::Rotation {
    fn from(rotation: Rotation) -> Self {
        match rotation {
            Rotation::Hourly => rolling::Rotation::HOURLY,
            Rotation::Daily => rolling::Rotation::DAILY,
            Rotation::Never => rolling::Rotation::NEVER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter() {
        let filter: LogFilter = "warn,drivehost::swarm=trace".parse().unwrap();
        assert_eq!(filter.to_string(), "warn,drivehost::swarm=trace");
        assert!("drivehost=loud".parse::<LogFilter>().is_err());
    }

    #[test]
    fn test_log_files_written() -> Result<()> {
        let dir = testdir::testdir!();
        let config = FileLogging {
            rotation: Rotation::Never,
            ..Default::default()
        };
        let (mut writer, guard) = non_blocking(config.appender(&dir)?);
        std::io::Write::write_all(&mut writer, b"hello\n")?;
        drop(guard);
        let names: Vec<_> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["drivehost.log".to_string()]);
        Ok(())
    }
}
