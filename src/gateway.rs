//! Write interceptor: makes the offline/online distinction invisible to
//! callers issuing domain writes.
//!
//! Online, a write goes straight to the backend; offline — or on any
//! network-level failure — it is committed to the durable local store and
//! the caller gets an optimistic success. Eventual failures are reconciled
//! asynchronously through the status surface, never through this call
//! path.

use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::network::NetworkMonitor;
use crate::remote::RemoteApi;
use crate::store::{RecordKind, Store};

/// How a write was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    /// Delivered to the backend directly.
    Sent,
    /// Committed to the local queue; the sync manager will deliver it.
    Queued,
}

#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub disposition: WriteDisposition,
    pub client_id: String,
}

pub struct OfflineGateway {
    monitor: Arc<NetworkMonitor>,
    store: Arc<Store>,
    remote: Arc<dyn RemoteApi>,
}

impl OfflineGateway {
    pub fn new(monitor: Arc<NetworkMonitor>, store: Arc<Store>, remote: Arc<dyn RemoteApi>) -> Self {
        Self {
            monitor,
            store,
            remote,
        }
    }

    /// Issue a domain write. The payload must already be fully formed (all
    /// derived fields computed by the caller): it may be replayed verbatim,
    /// unmodified, much later.
    ///
    /// Only a local-store failure surfaces as an error; network trouble of
    /// any kind falls back to the queue so a transient failure never blocks
    /// the cashier's workflow.
    pub async fn write(&self, kind: RecordKind, payload: Value) -> Result<WriteOutcome> {
        // The idempotency key is fixed before the first network attempt. If
        // a direct submit fails with a lost acknowledgment, the queued
        // replay carries the same id and the server collapses it.
        let client_id = Uuid::new_v4().to_string();

        if self.monitor.is_online() {
            match self.remote.submit(kind, &client_id, &payload).await {
                Ok(ack) => {
                    if ack.duplicate {
                        info!(kind = kind.as_str(), client_id = %client_id,
                              "Direct write collapsed as duplicate by server");
                    }
                    return Ok(WriteOutcome {
                        disposition: WriteDisposition::Sent,
                        client_id,
                    });
                }
                Err(e) if e.is_network_level() => {
                    warn!(kind = kind.as_str(), client_id = %client_id,
                          "Direct write failed ({e}); queueing for sync");
                    self.monitor.report_offline();
                }
                Err(e) => {
                    // Server reached us and said no. Still queued rather
                    // than surfaced: the record stays visible in the status
                    // surface and gets its retries there.
                    warn!(kind = kind.as_str(), client_id = %client_id,
                          "Backend rejected direct write ({e}); queueing for retry");
                }
            }
        }

        self.store.enqueue_with_id(kind, &client_id, &payload)?;
        Ok(WriteOutcome {
            disposition: WriteDisposition::Queued,
            client_id,
        })
    }

    /// Convenience wrapper for order writes.
    pub async fn write_order(&self, payload: Value) -> Result<WriteOutcome> {
        self.write(RecordKind::Order, payload).await
    }

    /// Convenience wrapper for cash movement writes.
    pub async fn write_cash_transaction(&self, payload: Value) -> Result<WriteOutcome> {
        self.write(RecordKind::CashTransaction, payload).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
