//! Network monitor: single source of truth for backend reachability.
//!
//! The OS-level connectivity flag is necessary but not sufficient (a device
//! can report "online" while the backend is unreachable), so the monitor
//! combines host-reported signals with an active short-timeout probe
//! against the backend health endpoint.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

/// Connectivity transition delivered to subscribers.
///
/// `Reconnect` fires only on a confirmed offline -> online transition,
/// never on a redundant "online" signal, so subscribers can use it to
/// trigger a sync without double-firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Online,
    Offline,
    Reconnect,
}

/// Current connectivity view.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    pub is_online: bool,
    /// True when the current online state was preceded by an offline period.
    pub was_offline: bool,
    pub last_online_at: Option<DateTime<Utc>>,
    pub last_offline_at: Option<DateTime<Utc>>,
}

struct MonitorInner {
    is_online: bool,
    was_offline: bool,
    last_online_at: Option<DateTime<Utc>>,
    last_offline_at: Option<DateTime<Utc>>,
}

type Subscriber = Box<dyn Fn(NetworkEvent) + Send + Sync>;

pub struct NetworkMonitor {
    inner: Mutex<MonitorInner>,
    subscribers: Mutex<Vec<Subscriber>>,
    online_tx: watch::Sender<bool>,
    probe_client: reqwest::Client,
    probe_url: String,
    api_key: Option<String>,
}

impl NetworkMonitor {
    /// Build a monitor probing `{base_url}{health_path}`. Starts optimistic
    /// (online) until a probe or host signal says otherwise.
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let probe_client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .map_err(|e| SyncError::NetworkUnreachable(format!("build probe client: {e}")))?;
        let (online_tx, _) = watch::channel(true);

        Ok(Self {
            inner: Mutex::new(MonitorInner {
                is_online: true,
                was_offline: false,
                last_online_at: None,
                last_offline_at: None,
            }),
            subscribers: Mutex::new(Vec::new()),
            online_tx,
            probe_client,
            probe_url: format!("{}{}", config.base_url, config.health_path),
            api_key: config.api_key.clone(),
        })
    }

    pub fn status(&self) -> NetworkStatus {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        NetworkStatus {
            is_online: inner.is_online,
            was_offline: inner.was_offline,
            last_online_at: inner.last_online_at,
            last_offline_at: inner.last_offline_at,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status().is_online
    }

    /// Register a transition subscriber. Callbacks run on the task that
    /// observed the transition and must not block.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(NetworkEvent) + Send + Sync + 'static,
    {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Box::new(callback));
        }
    }

    /// Host-reported connectivity signal (e.g. the OS "online" event).
    pub fn report_online(&self) {
        self.apply(true);
    }

    /// Host-reported connectivity signal (e.g. the OS "offline" event).
    pub fn report_offline(&self) {
        self.apply(false);
    }

    /// Active reachability probe: short-timeout, cache-busting HEAD request
    /// straight at the backend (bypassing any asset cache). Probe failures
    /// are non-fatal and only inform status; this never returns an error.
    pub async fn check_actual_connectivity(&self) -> bool {
        // Cache-busting query so an intermediary can never answer for the
        // backend.
        let url = format!("{}?t={}", self.probe_url, Utc::now().timestamp_millis());
        let mut req = self.probe_client.head(&url);
        if let Some(ref key) = self.api_key {
            req = req.header("X-POS-API-Key", key);
        }

        let started = std::time::Instant::now();
        let reachable = match req.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Connectivity probe failed: {e}");
                false
            }
        };
        if reachable {
            debug!(
                latency_ms = started.elapsed().as_millis() as u64,
                "Connectivity probe passed"
            );
        }

        self.apply(reachable);
        reachable
    }

    /// Suspend until an online transition or the timeout, whichever first.
    pub async fn wait_for_online(&self, timeout: Duration) -> Result<()> {
        if self.is_online() {
            return Ok(());
        }
        let mut rx = self.online_tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender lives as long as the monitor; treat closure as
                    // a permanent offline state and let the timeout fire.
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SyncError::NetworkTimeout)
    }

    /// Fold a new connectivity observation into state, emitting events on
    /// transitions only. The reconnect flag is derived here, at transition
    /// time, not inferred by subscribers.
    fn apply(&self, is_online: bool) {
        let events = {
            let mut inner = match self.inner.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Utc::now();

            if is_online == inner.is_online {
                // Redundant signal; refresh the timestamp only.
                if is_online {
                    inner.last_online_at = Some(now);
                } else {
                    inner.last_offline_at = Some(now);
                }
                Vec::new()
            } else if is_online {
                inner.is_online = true;
                inner.was_offline = true;
                inner.last_online_at = Some(now);
                info!("Network restored; backend reachable again");
                vec![NetworkEvent::Online, NetworkEvent::Reconnect]
            } else {
                inner.is_online = false;
                inner.last_offline_at = Some(now);
                warn!("Network lost; backend unreachable");
                vec![NetworkEvent::Offline]
            }
        };

        if events.is_empty() {
            return;
        }

        // send_replace updates the channel even with no receivers alive, so
        // a later wait_for_online never observes a stale value.
        self.online_tx.send_replace(is_online);
        if let Ok(subs) = self.subscribers.lock() {
            for event in &events {
                for sub in subs.iter() {
                    sub(*event);
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_monitor() -> NetworkMonitor {
        NetworkMonitor::new(&SyncConfig::new("pos.example.com", "/tmp/unused"))
            .expect("build monitor")
    }

    #[test]
    fn test_reconnect_fires_only_on_offline_to_online_transition() {
        let monitor = test_monitor();
        let reconnects = Arc::new(AtomicUsize::new(0));
        let onlines = Arc::new(AtomicUsize::new(0));
        {
            let reconnects = reconnects.clone();
            let onlines = onlines.clone();
            monitor.subscribe(move |event| match event {
                NetworkEvent::Reconnect => {
                    reconnects.fetch_add(1, Ordering::SeqCst);
                }
                NetworkEvent::Online => {
                    onlines.fetch_add(1, Ordering::SeqCst);
                }
                NetworkEvent::Offline => {}
            });
        }

        // Redundant online signals: no events at all.
        monitor.report_online();
        monitor.report_online();
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);
        assert_eq!(onlines.load(Ordering::SeqCst), 0);

        monitor.report_offline();
        monitor.report_online();
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
        assert_eq!(onlines.load(Ordering::SeqCst), 1);

        // Another redundant online: still one reconnect.
        monitor.report_online();
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_tracks_transitions() {
        let monitor = test_monitor();
        assert!(monitor.status().is_online);
        assert!(!monitor.status().was_offline);

        monitor.report_offline();
        let status = monitor.status();
        assert!(!status.is_online);
        assert!(status.last_offline_at.is_some());

        monitor.report_online();
        let status = monitor.status();
        assert!(status.is_online);
        assert!(status.was_offline);
        assert!(status.last_online_at.is_some());
    }

    #[tokio::test]
    async fn test_wait_for_online_returns_immediately_when_online() {
        let monitor = test_monitor();
        monitor
            .wait_for_online(Duration::from_millis(10))
            .await
            .expect("already online");
    }

    #[tokio::test]
    async fn test_wait_for_online_times_out() {
        let monitor = test_monitor();
        monitor.report_offline();
        let result = monitor.wait_for_online(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(SyncError::NetworkTimeout)));
    }

    #[tokio::test]
    async fn test_transitions_without_waiters_are_not_lost() {
        let monitor = test_monitor();
        // No wait_for_online caller exists during these transitions; the
        // channel must still track the latest state.
        monitor.report_offline();
        monitor.report_online();
        monitor.report_offline();

        let result = monitor.wait_for_online(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(SyncError::NetworkTimeout)));

        monitor.report_online();
        monitor
            .wait_for_online(Duration::from_millis(50))
            .await
            .expect("online again");
    }

    #[tokio::test]
    async fn test_wait_for_online_wakes_on_transition() {
        let monitor = Arc::new(test_monitor());
        monitor.report_offline();

        let waiter = monitor.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_online(Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.report_online();

        handle.await.expect("join").expect("online transition observed");
    }

    #[tokio::test]
    async fn test_probe_failure_is_nonfatal_and_marks_offline() {
        // Unroutable backend: the probe must fold the failure into status
        // without erroring.
        let mut cfg = SyncConfig::new("http://127.0.0.1:9", "/tmp/unused");
        cfg.probe_timeout = Duration::from_millis(200);
        let monitor = NetworkMonitor::new(&cfg).expect("build monitor");

        let reachable = monitor.check_actual_connectivity().await;
        assert!(!reachable);
        assert!(!monitor.status().is_online);
    }
}
