//! Tracing setup for the driver and the per-tile worker.
//!
//! Both write to a log file truncated at start and echo to stdout. The level
//! defaults to `info` and follows `RUST_LOG` when set.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the non-blocking file writer alive; dropping it flushes the log.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Default driver log file inside the run log directory.
pub const RUN_LOG_FILE: &str = "classify_bricks.log";

/// Create `log_dir` and an empty `log_file` inside it.
pub fn prepare_log_file(log_dir: &Path, log_file: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(log_dir)?;
    let path = log_dir.join(log_file);
    fs::write(&path, "")?;
    Ok(path)
}

/// Per-tile log file name.
pub fn tile_log_file(tile_name: &str) -> String {
    format!("{tile_name}.log")
}

/// Install the global subscriber: `<log_dir>/<log_file>` plus stdout.
pub fn init_logging(log_dir: &Path, log_file: &str) -> io::Result<LoggingGuard> {
    prepare_log_file(log_dir, log_file)?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(false);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_target(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(io::Error::other)?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Worker logging: one file per tile, `<log_dir>/<tile>.log`.
pub fn init_tile_logging(log_dir: &Path, tile_name: &str) -> io::Result<LoggingGuard> {
    init_logging(log_dir, &tile_log_file(tile_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_creates_nested_dir_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs/subsetLogs");

        let path = prepare_log_file(&log_dir, "t.log").unwrap();
        assert!(path.exists());

        fs::write(&path, "previous run").unwrap();
        prepare_log_file(&log_dir, "t.log").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn tile_logs_are_named_after_the_tile() {
        assert_eq!(tile_log_file("T32UMU_3.2_sub"), "T32UMU_3.2_sub.log");
    }

    #[test]
    fn guard_wraps_a_worker_guard() {
        let (writer, guard) = tracing_appender::non_blocking(io::sink());
        drop(writer);
        let _guard = LoggingGuard { _file_guard: guard };
    }
}
