//! Sync manager: drains the durable local store to the backend.
//!
//! One drain pass loads every poppable record oldest-first and submits each
//! with its `clientId` so the server can deduplicate. Only one pass runs at
//! a time system-wide; a trigger arriving while a pass is in flight is a
//! no-op, since the in-flight pass already covers any records present at
//! request time and the next reconnect/timer/manual event starts a fresh
//! one.
//!
//! Individual item failure never aborts a pass. Cross-pass retry is what
//! the per-record attempt counter and future triggers provide.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::db;
use crate::error::{Result, SyncError};
use crate::network::{NetworkEvent, NetworkMonitor};
use crate::remote::RemoteApi;
use crate::store::Store;

// ---------------------------------------------------------------------------
// Progress & result types
// ---------------------------------------------------------------------------

/// Phase of the drain state machine. Always settles back to a terminal
/// `Completed` or `Failed` emission before the next pass starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Idle,
    Syncing,
    Completed,
    Failed,
}

/// Transient per-item progress, emitted to subscribers during a pass.
/// Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SyncProgress {
    pub status: ProgressStatus,
    pub total_items: usize,
    pub current_item: usize,
    pub message: String,
}

/// Summary of one completed drain pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub total_items: usize,
    pub synced_items: usize,
    pub failed_items: usize,
    pub errors: Vec<String>,
}

type ProgressSubscriber = Box<dyn Fn(&SyncProgress) + Send + Sync>;

// ---------------------------------------------------------------------------
// Sync manager
// ---------------------------------------------------------------------------

/// Explicitly constructed, injected sync service. Owns the single-flight
/// flag and the subscriber list; lifecycle belongs to the application root,
/// not a module-level global.
pub struct SyncManager {
    store: Arc<Store>,
    remote: Arc<dyn RemoteApi>,
    monitor: Arc<NetworkMonitor>,
    in_flight: AtomicBool,
    loop_running: Arc<AtomicBool>,
    last_sync: Mutex<Option<String>>,
    subscribers: Mutex<Vec<ProgressSubscriber>>,
    sync_interval: Duration,
    retention: Duration,
}

impl SyncManager {
    pub fn new(
        store: Arc<Store>,
        remote: Arc<dyn RemoteApi>,
        monitor: Arc<NetworkMonitor>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            monitor,
            in_flight: AtomicBool::new(false),
            loop_running: Arc::new(AtomicBool::new(false)),
            last_sync: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            sync_interval: config.sync_interval,
            retention: config.retention,
        }
    }

    /// Register a progress subscriber. Called on pass start, after every
    /// item, and on pass finish.
    pub fn subscribe_progress<F>(&self, callback: F)
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Box::new(callback));
        }
    }

    /// Timestamp of the last completed pass. Falls back to the persisted
    /// setting so the value survives restarts.
    pub fn last_sync(&self) -> Option<String> {
        if let Ok(guard) = self.last_sync.lock() {
            if guard.is_some() {
                return guard.clone();
            }
        }
        let conn = self.store.db().conn.lock().ok()?;
        db::get_setting(&conn, "sync", "last_sync")
    }

    /// Single-flight entry point for all triggers (reconnect, timer,
    /// manual). Returns `None` when a pass is already in flight.
    pub async fn trigger_sync(&self) -> Result<Option<SyncResult>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain pass already in flight; trigger ignored");
            return Ok(None);
        }

        let outcome = self.run_drain_pass().await;
        self.in_flight.store(false, Ordering::SeqCst);

        match outcome {
            Ok(result) => {
                self.record_last_sync();
                Ok(Some(result))
            }
            Err(e) => Err(e),
        }
    }

    /// One complete drain pass over all currently poppable records.
    async fn run_drain_pass(&self) -> Result<SyncResult> {
        let records = self.store.list_pending(None)?;
        let total_items = records.len();

        if total_items == 0 {
            self.emit(&SyncProgress {
                status: ProgressStatus::Completed,
                total_items: 0,
                current_item: 0,
                message: "Nothing to sync".to_string(),
            });
            return Ok(SyncResult {
                success: true,
                total_items: 0,
                synced_items: 0,
                failed_items: 0,
                errors: Vec::new(),
            });
        }

        info!(total_items, "Drain pass started");
        self.emit(&SyncProgress {
            status: ProgressStatus::Syncing,
            total_items,
            current_item: 0,
            message: format!("Syncing {total_items} pending records"),
        });

        let mut synced_items = 0;
        let mut failed_items = 0;
        let mut errors = Vec::new();

        for (index, record) in records.iter().enumerate() {
            let current_item = index + 1;

            match self.store.mark_syncing(&record.client_id) {
                Ok(()) => {}
                Err(SyncError::ConcurrentSyncConflict(detail)) => {
                    // Claimed between listing and now; leave it for whoever
                    // holds it.
                    debug!(client_id = %record.client_id, "Skipping contested record: {detail}");
                    continue;
                }
                Err(e) => return Err(e),
            }

            let message = match self
                .remote
                .submit(record.kind, &record.client_id, &record.payload)
                .await
            {
                Ok(ack) => {
                    self.store.mark_synced(&record.client_id)?;
                    synced_items += 1;
                    if ack.duplicate {
                        format!(
                            "Synced {} {current_item}/{total_items} (already applied)",
                            record.kind.as_str()
                        )
                    } else {
                        format!("Synced {} {current_item}/{total_items}", record.kind.as_str())
                    }
                }
                Err(e) => {
                    let detail = e.to_string();
                    self.store.mark_failed(&record.client_id, &detail)?;
                    failed_items += 1;
                    errors.push(format!(
                        "{} {}: {detail}",
                        record.kind.as_str(),
                        record.client_id
                    ));
                    warn!(
                        client_id = %record.client_id,
                        attempts = record.attempts + 1,
                        "Record sync failed: {detail}"
                    );
                    format!("Failed {} {current_item}/{total_items}", record.kind.as_str())
                }
            };

            // Per-item progress emission is the pass's yield point; it
            // keeps a UI responsive during long drains.
            self.emit(&SyncProgress {
                status: ProgressStatus::Syncing,
                total_items,
                current_item,
                message,
            });
            tokio::task::yield_now().await;
        }

        let success = failed_items == 0;
        self.emit(&SyncProgress {
            status: if success {
                ProgressStatus::Completed
            } else {
                ProgressStatus::Failed
            },
            total_items,
            current_item: total_items,
            message: format!("Sync finished: {synced_items} synced, {failed_items} failed"),
        });
        info!(synced_items, failed_items, "Drain pass finished");

        Ok(SyncResult {
            success,
            total_items,
            synced_items,
            failed_items,
            errors,
        })
    }

    /// Wire the reconnect trigger: a confirmed offline -> online transition
    /// with pending work starts a drain. Redundant online signals never
    /// reach here; the monitor only emits `Reconnect` on real transitions.
    pub fn install_reconnect_trigger(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        self.monitor.subscribe(move |event| {
            if event != NetworkEvent::Reconnect {
                return;
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                warn!("Reconnect observed outside runtime; timer will pick up the queue");
                return;
            };
            handle.spawn(async move {
                let pending = match manager.store.pending_counts() {
                    Ok(counts) => counts.total,
                    Err(e) => {
                        warn!("Reconnect trigger could not read pending counts: {e}");
                        return;
                    }
                };
                if pending == 0 {
                    return;
                }
                info!(pending, "Reconnect detected; draining queue");
                if let Err(e) = manager.trigger_sync().await {
                    warn!("Reconnect-triggered sync failed: {e}");
                }
            });
        });
    }

    /// Start the background timer loop, the safety net for missed reconnect
    /// events. Each cycle probes actual connectivity, runs the retention
    /// sweep, and drains if anything is pending.
    pub fn start_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let is_running = self.loop_running.clone();
        is_running.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            info!(
                interval_secs = manager.sync_interval.as_secs(),
                "Sync loop started"
            );
            loop {
                tokio::time::sleep(manager.sync_interval).await;
                if !is_running.load(Ordering::SeqCst) {
                    info!("Sync loop stopped");
                    break;
                }

                // Probe first; the monitor folds the result into status and
                // emits transitions for other subscribers.
                if !manager.monitor.check_actual_connectivity().await {
                    debug!("Backend unreachable; keeping queue pending");
                    continue;
                }

                if let Err(e) = manager.store.purge_synced(manager.retention) {
                    warn!("Retention sweep failed: {e}");
                }

                let pending = manager
                    .store
                    .pending_counts()
                    .map(|c| c.total)
                    .unwrap_or(0);
                if pending == 0 {
                    continue;
                }

                match manager.trigger_sync().await {
                    Ok(Some(result)) if result.synced_items > 0 => {
                        info!(
                            synced = result.synced_items,
                            failed = result.failed_items,
                            "Timer sync cycle complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Timer sync cycle failed: {e}"),
                }
            }
        })
    }

    /// Stop the background loop after its current cycle.
    pub fn stop(&self) {
        self.loop_running.store(false, Ordering::SeqCst);
    }

    fn emit(&self, progress: &SyncProgress) {
        if let Ok(subs) = self.subscribers.lock() {
            for sub in subs.iter() {
                sub(progress);
            }
        }
    }

    fn record_last_sync(&self) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(now.clone());
        }
        if let Ok(conn) = self.store.db().conn.lock() {
            if let Err(e) = db::set_setting(&conn, "sync", "last_sync", &now) {
                warn!("Persisting last_sync failed: {e}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
