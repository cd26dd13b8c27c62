//! Status surface: the single read-model a till UI binds to.
//!
//! Combines the network monitor, the durable store counters, and the sync
//! manager's progress stream into one snapshot, plus the two operator
//! actions (manual sync, retry failed). Pure composition; no state of its
//! own beyond the latest observed progress.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::error::Result;
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::store::{PendingCounts, Store};
use crate::sync::{SyncManager, SyncProgress, SyncResult};

/// Everything a status bar needs in one read.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub network: NetworkStatus,
    pub pending: PendingCounts,
    /// Records that exhausted their attempts and need operator attention.
    pub failed: i64,
    pub last_sync: Option<String>,
    pub last_progress: Option<SyncProgress>,
}

pub struct StatusSurface {
    monitor: Arc<NetworkMonitor>,
    store: Arc<Store>,
    manager: Arc<SyncManager>,
    last_progress: Arc<Mutex<Option<SyncProgress>>>,
}

impl StatusSurface {
    /// Build the surface and hook it into the manager's progress stream so
    /// snapshots always carry the latest pass state.
    pub fn new(
        monitor: Arc<NetworkMonitor>,
        store: Arc<Store>,
        manager: Arc<SyncManager>,
    ) -> Self {
        let last_progress = Arc::new(Mutex::new(None));
        {
            let last_progress = last_progress.clone();
            manager.subscribe_progress(move |progress| {
                if let Ok(mut guard) = last_progress.lock() {
                    *guard = Some(progress.clone());
                }
            });
        }
        Self {
            monitor,
            store,
            manager,
            last_progress,
        }
    }

    pub fn snapshot(&self) -> Result<StatusSnapshot> {
        let last_progress = self
            .last_progress
            .lock()
            .map(|g| g.clone())
            .unwrap_or(None);
        Ok(StatusSnapshot {
            network: self.monitor.status(),
            pending: self.store.pending_counts()?,
            failed: self.store.failed_count()?,
            last_sync: self.manager.last_sync(),
            last_progress,
        })
    }

    pub fn pending_counts(&self) -> Result<PendingCounts> {
        self.store.pending_counts()
    }

    /// Forward a progress subscription to the manager, for UIs that want a
    /// push stream instead of polling snapshots.
    pub fn subscribe_progress<F>(&self, callback: F)
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        self.manager.subscribe_progress(callback);
    }

    /// Operator-initiated sync. Same single-flight path as every other
    /// trigger; `None` means a pass was already running.
    pub async fn trigger_manual_sync(&self) -> Result<Option<SyncResult>> {
        info!("Manual sync requested");
        self.manager.trigger_sync().await
    }

    /// Requeue one permanently-failed record with a fresh attempt budget.
    pub fn retry_failed(&self, client_id: &str) -> Result<()> {
        self.store.retry_failed(client_id)
    }

    /// Requeue every permanently-failed record. Returns how many were
    /// requeued.
    pub fn retry_all_failed(&self) -> Result<usize> {
        let requeued = self.store.retry_all_failed()?;
        if requeued > 0 {
            info!(requeued, "Failed records returned to the queue");
        }
        Ok(requeued)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::db::{self, DbState};
    use crate::error::SyncError;
    use crate::remote::testing::FakeRemote;
    use crate::store::{RecordKind, SyncStatus};
    use rusqlite::Connection;
    use serde_json::json;

    fn fixture() -> (Arc<Store>, Arc<NetworkMonitor>, Arc<SyncManager>, Arc<FakeRemote>) {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        let store = Arc::new(Store::with_db(
            DbState {
                conn: std::sync::Mutex::new(conn),
                db_path: std::path::PathBuf::from(":memory:"),
            },
            &SyncConfig::new("pos.example.com", "/tmp/unused"),
        ));
        let monitor = Arc::new(
            NetworkMonitor::new(&SyncConfig::new("pos.example.com", "/tmp/unused"))
                .expect("build monitor"),
        );
        let remote = Arc::new(FakeRemote::always_ok());
        let manager = Arc::new(SyncManager::new(
            store.clone(),
            remote.clone(),
            monitor.clone(),
            &SyncConfig::new("pos.example.com", "/tmp/unused"),
        ));
        (store, monitor, manager, remote)
    }

    #[tokio::test]
    async fn test_snapshot_combines_all_sources() {
        let (store, monitor, manager, _remote) = fixture();
        let surface = StatusSurface::new(monitor.clone(), store.clone(), manager);

        store.enqueue(RecordKind::Order, &json!({})).unwrap();
        store
            .enqueue(RecordKind::CashTransaction, &json!({}))
            .unwrap();
        monitor.report_offline();

        let snap = surface.snapshot().unwrap();
        assert!(!snap.network.is_online);
        assert_eq!(snap.pending.orders, 1);
        assert_eq!(snap.pending.cash_transactions, 1);
        assert_eq!(snap.pending.total, 2);
        assert_eq!(snap.failed, 0);
        assert!(snap.last_progress.is_none());
    }

    #[tokio::test]
    async fn test_manual_sync_updates_snapshot() {
        let (store, monitor, manager, _remote) = fixture();
        let surface = StatusSurface::new(monitor, store.clone(), manager);

        store.enqueue(RecordKind::Order, &json!({})).unwrap();
        let result = surface
            .trigger_manual_sync()
            .await
            .unwrap()
            .expect("not in flight");
        assert!(result.success);

        let snap = surface.snapshot().unwrap();
        assert_eq!(snap.pending.total, 0);
        assert!(snap.last_sync.is_some());
        let progress = snap.last_progress.expect("progress observed");
        assert_eq!(progress.total_items, 1);
    }

    #[tokio::test]
    async fn test_retry_all_failed_requeues_exhausted_records() {
        let (store, monitor, manager, _remote) = fixture();
        let surface = StatusSurface::new(monitor, store.clone(), manager);

        let id = store.enqueue(RecordKind::Order, &json!({})).unwrap();
        for _ in 0..5 {
            store.mark_syncing(&id).unwrap();
            store.mark_failed(&id, "boom").unwrap();
            // Back to pending until the cap; clear the backoff gate so
            // mark_syncing can claim it again.
            let conn = store.db().conn.lock().unwrap();
            let _ = conn.execute("UPDATE pending_orders SET next_retry_at = NULL", []);
        }
        assert_eq!(store.get(&id).unwrap().unwrap().status, SyncStatus::Failed);
        assert_eq!(surface.snapshot().unwrap().failed, 1);

        let requeued = surface.retry_all_failed().unwrap();
        assert_eq!(requeued, 1);
        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.attempts, 0);
    }

    #[tokio::test]
    async fn test_retry_failed_rejects_unknown_record() {
        let (store, monitor, manager, _remote) = fixture();
        let surface = StatusSurface::new(monitor, store, manager);
        let result = surface.retry_failed("no-such-id");
        assert!(matches!(result, Err(SyncError::UnknownRecord(_))));
    }
}
