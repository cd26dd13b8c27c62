//! Offline-first synchronization core for a retail till.
//!
//! Every domain write goes through the [`gateway::OfflineGateway`]: online,
//! it is delivered straight to the backend; offline (or on any network
//! failure), it is committed to a durable SQLite queue under a
//! client-generated id and replayed later by the [`sync::SyncManager`]. The
//! backend deduplicates on that id, so a replayed write is applied exactly
//! once even when the acknowledgment of an earlier attempt was lost.
//!
//! [`network::NetworkMonitor`] is the single source of truth for backend
//! reachability, [`status::StatusSurface`] is the read-model a till UI
//! binds to, and [`assets::AssetCache`] keeps the static frontend usable
//! while offline.

pub mod assets;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod network;
pub mod remote;
pub mod status;
pub mod store;
pub mod sync;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use gateway::{OfflineGateway, WriteDisposition, WriteOutcome};
pub use network::{NetworkEvent, NetworkMonitor, NetworkStatus};
pub use remote::{HttpRemoteApi, RemoteApi, SubmitAck};
pub use status::{StatusSnapshot, StatusSurface};
pub use store::{PendingCounts, PendingRecord, RecordKind, Store, SyncStatus};
pub use sync::{ProgressStatus, SyncManager, SyncProgress, SyncResult};

use std::sync::Arc;
use tracing::info;

/// Fully wired sync core: one call builds the store, monitor, remote
/// client, gateway, sync manager, and status surface from a single config.
pub struct SyncCore {
    pub store: Arc<Store>,
    pub monitor: Arc<NetworkMonitor>,
    pub gateway: Arc<OfflineGateway>,
    pub manager: Arc<SyncManager>,
    pub status: Arc<StatusSurface>,
    pub assets: Arc<assets::AssetCache>,
}

impl SyncCore {
    /// Open the local database, recover interrupted work, and wire every
    /// component together. Background work does not start until
    /// [`SyncCore::start`].
    pub fn open(config: &SyncConfig) -> Result<Self> {
        let store = Arc::new(Store::open(config)?);
        let monitor = Arc::new(NetworkMonitor::new(config)?);
        let remote: Arc<dyn RemoteApi> = Arc::new(HttpRemoteApi::new(config)?);

        let gateway = Arc::new(OfflineGateway::new(
            monitor.clone(),
            store.clone(),
            remote.clone(),
        ));
        let manager = Arc::new(SyncManager::new(
            store.clone(),
            remote,
            monitor.clone(),
            config,
        ));
        let status = Arc::new(StatusSurface::new(
            monitor.clone(),
            store.clone(),
            manager.clone(),
        ));
        let assets = Arc::new(assets::AssetCache::new(config)?);

        info!(base_url = %config.base_url, "Sync core ready");
        Ok(Self {
            store,
            monitor,
            gateway,
            manager,
            status,
            assets,
        })
    }

    /// Install the reconnect trigger and start the background sync loop.
    /// Must run inside a tokio runtime.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.manager.install_reconnect_trigger();
        self.manager.start_loop()
    }

    /// Stop the background loop after its current cycle.
    pub fn stop(&self) {
        self.manager.stop();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
