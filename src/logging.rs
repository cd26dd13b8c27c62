//! Structured logging setup: console plus daily rolling file.
//!
//! Call `init` once at startup. Log files land in `{data_dir}/logs` as
//! `tillsync.YYYY-MM-DD`; old files are pruned before the appender opens so
//! an offline till that runs for months does not fill its disk.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maximum number of daily log files to retain.
const MAX_LOG_FILES: usize = 14;

const LOG_FILE_PREFIX: &str = "tillsync";

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Initialize structured logging (console + rolling file).
///
/// Filter comes from `RUST_LOG` when set, defaulting to info with debug
/// for this crate. Safe to call once per process; a second call is a no-op
/// because the global subscriber is already set.
pub fn init(data_dir: &Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tillsync=debug"));

    // Prune old log files before setting up the appender
    prune_old_logs(data_dir);

    let log_dir = log_dir(data_dir);
    fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    let initialized = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if initialized {
        // Keep the guard alive for the lifetime of the process; dropping it
        // flushes and closes the file writer.
        std::mem::forget(guard);
        info!("Logging initialized, files in {}", log_dir.display());
    }
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(data_dir: &Path) {
    let log_dir = log_dir(data_dir);
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(&log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if name.starts_with(LOG_FILE_PREFIX) {
                        let modified = entry
                            .metadata()
                            .ok()
                            .and_then(|m| m.modified().ok())
                            .unwrap_or(std::time::UNIX_EPOCH);
                        log_files.push((path, modified));
                    }
                }
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prune_keeps_most_recent_files() {
        let dir = TempDir::new().unwrap();
        let logs = log_dir(dir.path());
        fs::create_dir_all(&logs).unwrap();

        for i in 0..(MAX_LOG_FILES + 3) {
            let path = logs.join(format!("{LOG_FILE_PREFIX}.2026-01-{:02}", i + 1));
            fs::write(&path, b"line\n").unwrap();
        }
        // An unrelated file must survive regardless of count.
        fs::write(logs.join("notes.txt"), b"keep me").unwrap();

        prune_old_logs(dir.path());

        let remaining = fs::read_dir(&logs)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX))
            })
            .count();
        assert_eq!(remaining, MAX_LOG_FILES);
        assert!(logs.join("notes.txt").exists());
    }

    #[test]
    fn test_prune_tolerates_missing_dir() {
        let dir = TempDir::new().unwrap();
        prune_old_logs(dir.path());
    }
}
