//! Asset cache: network-first static asset fetching with a disk fallback.
//!
//! Every successful fetch refreshes the on-disk copy, keyed by an md5 of
//! the full URL. When the backend is unreachable the cached copy is served
//! instead; a page navigation with no cached copy gets the offline shell so
//! the till never renders a browser error page.
//!
//! API calls are never served from here. `is_api_path` is the guard: data
//! freshness and idempotent replay belong to the sync queue, not a byte
//! cache.

use reqwest::Client;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

/// Built-in offline shell, served for navigations with no cached copy.
const OFFLINE_SHELL: &str = "<!doctype html>\
<html lang=\"en\"><head><meta charset=\"utf-8\">\
<title>Offline</title></head>\
<body><h1>Working offline</h1>\
<p>The till is running from local data. Sales keep working; \
everything queues and syncs when the connection returns.</p>\
</body></html>";

/// True for request paths that must bypass the asset cache entirely.
pub fn is_api_path(path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    path.starts_with("/api/") || path == "/api"
}

/// One fetched (or recovered) asset.
#[derive(Debug, Clone)]
pub struct CachedAsset {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Served from disk because the network fetch failed.
    pub from_cache: bool,
}

pub struct AssetCache {
    client: Client,
    cache_dir: PathBuf,
}

impl AssetCache {
    /// Build a cache rooted at `{data_dir}/asset_cache`.
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let cache_dir = config.data_dir.join("asset_cache");
        fs::create_dir_all(&cache_dir)?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::NetworkUnreachable(format!("build asset client: {e}")))?;
        Ok(Self { client, cache_dir })
    }

    /// Fetch a static asset, network first. A fresh copy always refreshes
    /// the disk cache; on network failure the cached copy is returned with
    /// `from_cache = true`.
    pub async fn fetch(&self, url: &str) -> Result<CachedAsset> {
        self.fetch_inner(url, false).await
    }

    /// Fetch a page navigation. Same as `fetch`, except a cache miss while
    /// offline returns the offline shell instead of an error.
    pub async fn fetch_navigation(&self, url: &str) -> Result<CachedAsset> {
        self.fetch_inner(url, true).await
    }

    async fn fetch_inner(&self, url: &str, is_navigation: bool) -> Result<CachedAsset> {
        if let Some(path) = url_path(url) {
            if is_api_path(path) {
                return Err(SyncError::NetworkUnreachable(format!(
                    "refusing to cache API request: {url}"
                )));
            }
        }

        match self.fetch_fresh(url).await {
            Ok(asset) => {
                if let Err(e) = self.store(url, &asset) {
                    // A cache write failure only costs the next offline hit.
                    warn!("Caching {url} failed: {e}");
                }
                Ok(asset)
            }
            Err(fetch_err) => {
                if let Some(asset) = self.load(url)? {
                    debug!("Serving {url} from asset cache");
                    return Ok(asset);
                }
                if is_navigation {
                    info!("No cached copy of {url}; serving offline shell");
                    return Ok(CachedAsset {
                        bytes: OFFLINE_SHELL.as_bytes().to_vec(),
                        content_type: "text/html; charset=utf-8".to_string(),
                        from_cache: true,
                    });
                }
                Err(fetch_err)
            }
        }
    }

    async fn fetch_fresh(&self, url: &str) -> Result<CachedAsset> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::NetworkUnreachable(format!("fetch {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::RemoteRejected {
                status: status.as_u16(),
                message: format!("asset fetch {url} returned HTTP {status}"),
            });
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SyncError::NetworkUnreachable(format!("read body of {url}: {e}")))?
            .to_vec();
        Ok(CachedAsset {
            bytes,
            content_type,
            from_cache: false,
        })
    }

    // -----------------------------------------------------------------------
    // Disk layer
    // -----------------------------------------------------------------------

    fn entry_paths(&self, url: &str) -> (PathBuf, PathBuf) {
        let key = format!("{:x}", md5::compute(url.as_bytes()));
        (
            self.cache_dir.join(&key),
            self.cache_dir.join(format!("{key}.meta")),
        )
    }

    fn store(&self, url: &str, asset: &CachedAsset) -> Result<()> {
        let (body_path, meta_path) = self.entry_paths(url);
        fs::write(&body_path, &asset.bytes)?;
        fs::write(&meta_path, &asset.content_type)?;
        Ok(())
    }

    fn load(&self, url: &str) -> Result<Option<CachedAsset>> {
        let (body_path, meta_path) = self.entry_paths(url);
        if !body_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&body_path)?;
        let content_type = fs::read_to_string(&meta_path)
            .unwrap_or_else(|_| "application/octet-stream".to_string());
        Ok(Some(CachedAsset {
            bytes,
            content_type,
            from_cache: true,
        }))
    }

    /// Drop every cached asset. Settings or queue data are untouched; the
    /// cache repopulates on the next online fetch.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Asset cache cleared");
        }
        Ok(removed)
    }

    #[cfg(test)]
    fn seed(&self, url: &str, bytes: &[u8], content_type: &str) {
        self.store(
            url,
            &CachedAsset {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
                from_cache: false,
            },
        )
        .expect("seed cache entry");
    }
}

/// Extract the path component of an absolute URL, if it has one.
fn url_path(url: &str) -> Option<&str> {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest)?;
    after_scheme.find('/').map(|i| &after_scheme[i..])
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_cache(dir: &TempDir) -> AssetCache {
        // Unroutable port: every network fetch fails fast.
        let mut cfg = SyncConfig::new("http://127.0.0.1:9", dir.path());
        cfg.request_timeout = Duration::from_millis(200);
        AssetCache::new(&cfg).expect("build cache")
    }

    #[test]
    fn test_is_api_path_guard() {
        assert!(is_api_path("/api/orders"));
        assert!(is_api_path("/api"));
        assert!(is_api_path("/api/health?t=123"));
        assert!(!is_api_path("/assets/app.js"));
        assert!(!is_api_path("/"));
        assert!(!is_api_path("/apiary"));
    }

    #[tokio::test]
    async fn test_api_urls_are_never_cached() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);
        let result = cache.fetch("http://127.0.0.1:9/api/orders").await;
        assert!(matches!(result, Err(SyncError::NetworkUnreachable(_))));
    }

    #[tokio::test]
    async fn test_offline_fetch_serves_cached_copy() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);
        let url = "http://127.0.0.1:9/assets/app.js";
        cache.seed(url, b"console.log('till');", "application/javascript");

        let asset = cache.fetch(url).await.expect("cache hit");
        assert!(asset.from_cache);
        assert_eq!(asset.bytes, b"console.log('till');");
        assert_eq!(asset.content_type, "application/javascript");
    }

    #[tokio::test]
    async fn test_offline_subresource_miss_is_an_error() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);
        let result = cache.fetch("http://127.0.0.1:9/assets/missing.css").await;
        assert!(matches!(result, Err(SyncError::NetworkUnreachable(_))));
    }

    #[tokio::test]
    async fn test_offline_navigation_miss_serves_shell() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);
        let asset = cache
            .fetch_navigation("http://127.0.0.1:9/till")
            .await
            .expect("shell fallback");
        assert!(asset.from_cache);
        assert!(asset.content_type.starts_with("text/html"));
        let html = String::from_utf8(asset.bytes).unwrap();
        assert!(html.contains("Working offline"));
    }

    #[tokio::test]
    async fn test_offline_navigation_prefers_cached_page_over_shell() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);
        let url = "http://127.0.0.1:9/till";
        cache.seed(url, b"<html>real page</html>", "text/html");

        let asset = cache.fetch_navigation(url).await.expect("cache hit");
        let html = String::from_utf8(asset.bytes).unwrap();
        assert!(html.contains("real page"));
    }

    #[tokio::test]
    async fn test_clear_removes_entries() {
        let dir = TempDir::new().unwrap();
        let cache = test_cache(&dir);
        let url = "http://127.0.0.1:9/assets/app.js";
        cache.seed(url, b"x", "text/plain");

        let removed = cache.clear().expect("clear");
        assert_eq!(removed, 2); // body + meta
        let result = cache.fetch(url).await;
        assert!(result.is_err());
    }
}
