//! provides logging helpers

use std::env;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Log file used when none is passed explicitly.
pub const LOG_PATH_ENV_VAR: &str = "CLOCK_MANAGER_LOG_PATH";

const DEFAULT_LOG_PREFIX: &str = "clock-manager.log";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Splits `path` into the appender directory and file name.
///
/// A directory gets the default file name.
pub fn split_log_path(path: &Path) -> (PathBuf, String) {
    if path.is_dir() {
        return (path.to_path_buf(), DEFAULT_LOG_PREFIX.to_string());
    }
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_PREFIX);
    (dir.to_path_buf(), prefix.to_string())
}

/// initiate the global tracing subscriber
///
/// Events go to stderr and, when `log_file` or `CLOCK_MANAGER_LOG_PATH` names
/// a file, to that file as well. Keep the returned guard alive until exit so
/// buffered lines are flushed.
pub fn init(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let log_file = log_file
        .map(Path::to_path_buf)
        .or_else(|| env::var(LOG_PATH_ENV_VAR).ok().map(PathBuf::from));

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let Some(log_file) = log_file else {
        registry().with(fmt_layer).init();
        return None;
    };

    let (dir, prefix) = split_log_path(&log_file);
    match RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(prefix)
        .build(&dir)
    {
        Ok(appender) => {
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter());
            registry().with(fmt_layer).with(file_layer).init();
            Some(guard)
        }
        Err(err) => {
            registry().with(fmt_layer).init();
            tracing::error!(
                "failed to create log file appender at {}: {err}; logging to stderr only",
                dir.display()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_path_is_split_into_dir_and_name() {
        let (dir, prefix) = split_log_path(Path::new("/var/log/clocks.log"));
        assert_eq!(dir, PathBuf::from("/var/log"));
        assert_eq!(prefix, "clocks.log");

        let (dir, prefix) = split_log_path(Path::new("clocks.log"));
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(prefix, "clocks.log");
    }

    #[test]
    fn directory_gets_default_name() {
        let dir = tempfile::tempdir().unwrap();
        let (split_dir, prefix) = split_log_path(dir.path());
        assert_eq!(split_dir, dir.path());
        assert_eq!(prefix, DEFAULT_LOG_PREFIX);
    }
}
