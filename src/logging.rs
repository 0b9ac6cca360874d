// src/logging.rs
//
// Log initialisation. Messages go to stderr, and optionally to a timestamped
// file in a log directory with a stable `wiretap-buffers.log` symlink
// pointing at the newest file (Unix only).

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{BufferError, Result};
use crate::settings::StoreSettings;

const SYMLINK_NAME: &str = "wiretap-buffers.log";

/// Keeps the file writer alive. Dropping it flushes and closes the log file.
pub struct FileLogGuard {
    _worker: WorkerGuard,
    pub path: PathBuf,
}

/// `RUST_LOG` wins over the configured level.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn install_error(e: impl std::fmt::Display) -> BufferError {
    BufferError::Settings(format!("Failed to install logger: {}", e))
}

/// Install a stderr logger at `level` ("info", "debug", or any EnvFilter directive).
pub fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(install_error)
}

/// Name of the log file for a run started at `now`.
pub(crate) fn log_file_name(now: chrono::DateTime<chrono::Local>) -> String {
    now.format("%Y%m%d-%H%M%S-wiretap-buffers.log").to_string()
}

/// Point the `wiretap-buffers.log` symlink at `filename` (Unix only; Windows
/// symlinks require elevated privileges).
fn update_symlink(log_dir: &Path, filename: &str) {
    #[cfg(unix)]
    {
        let symlink_path = log_dir.join(SYMLINK_NAME);
        // Remove existing symlink/file if present
        let _ = std::fs::remove_file(&symlink_path);
        if let Err(e) = std::os::unix::fs::symlink(filename, &symlink_path) {
            tracing::warn!("[logging] Failed to create {} symlink: {}", SYMLINK_NAME, e);
        }
    }
    #[cfg(not(unix))]
    let _ = (log_dir, filename);
}

/// Install a logger writing to stderr and to a new timestamped file in `log_dir`.
/// Keep the returned guard alive for as long as logging is needed.
pub fn init_file_logging(log_dir: &Path, level: &str) -> Result<FileLogGuard> {
    std::fs::create_dir_all(log_dir).map_err(|e| BufferError::File {
        path: log_dir.display().to_string(),
        message: format!("Failed to create log dir: {}", e),
    })?;

    let filename = log_file_name(chrono::Local::now());
    let appender = tracing_appender::rolling::never(log_dir, &filename);
    let (writer, worker) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .map_err(install_error)?;

    update_symlink(log_dir, &filename);

    let path = log_dir.join(&filename);
    tracing::info!("[logging] File logging started: {}", path.display());
    Ok(FileLogGuard { _worker: worker, path })
}

/// Install logging as configured: file logging when `log_dir` is set.
pub fn init_from_settings(settings: &StoreSettings) -> Result<Option<FileLogGuard>> {
    match &settings.log_dir {
        Some(dir) => init_file_logging(dir, &settings.log_level).map(Some),
        None => init_logging(&settings.log_level).map(|_| None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_file_name_format() {
        let now = chrono::Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(log_file_name(now), "20240309-140507-wiretap-buffers.log");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_points_at_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), "first").unwrap();
        std::fs::write(dir.path().join("b.log"), "second").unwrap();

        update_symlink(dir.path(), "a.log");
        update_symlink(dir.path(), "b.log");

        let link = dir.path().join(SYMLINK_NAME);
        assert_eq!(std::fs::read_link(&link).unwrap(), PathBuf::from("b.log"));
        assert_eq!(std::fs::read_to_string(&link).unwrap(), "second");
    }

    #[test]
    fn test_bad_level_falls_back() {
        // Must not panic on a malformed directive
        let _ = env_filter("not a level [");
    }
}
