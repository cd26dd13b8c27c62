//! Runtime configuration for the sync core.
//!
//! Everything is an explicit field with a default matching production
//! behaviour; nothing is read from globals. Callers construct one
//! `SyncConfig`, tweak what they need, and hand it to the services.

use std::path::PathBuf;
use std::time::Duration;

/// Default timeout for record submission during a drain (30 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the lightweight connectivity probe (3 seconds). Deliberately
/// short: a probe that hangs is as useless as one that fails.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Background sync loop interval (15 seconds).
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(15);

/// Attempts before a record is permanently failed and surfaced for manual
/// review.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

/// Base retry delay for a failed record (5 seconds).
pub const DEFAULT_RETRY_DELAY_MS: i64 = 5_000;

/// Retry delay cap (5 minutes).
pub const MAX_RETRY_DELAY_MS: i64 = 300_000;

/// How long synced records are retained before the purge sweep (7 days).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backend base URL, e.g. `https://admin.thesmall.app`.
    pub base_url: String,
    /// Optional API key sent as `X-POS-API-Key` on every request.
    pub api_key: Option<String>,
    /// Path probed for reachability, relative to `base_url`.
    pub health_path: String,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub sync_interval: Duration,
    pub max_attempts: i64,
    pub retry_delay_ms: i64,
    pub max_retry_delay_ms: i64,
    pub retention: Duration,
    /// Directory holding the SQLite database and asset cache.
    pub data_dir: PathBuf,
}

impl SyncConfig {
    pub fn new(base_url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            api_key: None,
            health_path: "/api/health".to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_retry_delay_ms: MAX_RETRY_DELAY_MS,
            retention: DEFAULT_RETENTION,
            data_dir: data_dir.into(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// Normalise the backend base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}
