//! Crate error taxonomy.
//!
//! Errors that cross module boundaries are typed; the policy for each
//! variant (recover locally, record per-item, skip, or propagate) lives
//! with the component that produces it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The backend could not be reached (connect failure, DNS, timeout).
    /// During a write this is recovered by enqueueing locally and is never
    /// surfaced to the caller.
    #[error("backend unreachable: {0}")]
    NetworkUnreachable(String),

    /// `wait_for_online` deadline elapsed without an online transition.
    #[error("timed out waiting for network to come online")]
    NetworkTimeout,

    /// The server rejected a record for a non-duplicate reason (validation
    /// failure, auth, 5xx). Recorded on the record, not thrown out of a
    /// drain pass.
    #[error("remote rejected (HTTP {status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// A persisted record could not be read back (malformed payload,
    /// missing column). Isolated to that record.
    #[error("local store corrupt: {0}")]
    LocalStoreCorrupt(String),

    /// `mark_syncing` lost the race against another drain. Expected; the
    /// record is skipped for the current pass.
    #[error("record already syncing: {0}")]
    ConcurrentSyncConflict(String),

    /// No record with the given client id.
    #[error("unknown record: {0}")]
    UnknownRecord(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// True when the error means "the backend never saw the request" — the
    /// write interceptor falls back to the queue on these.
    pub fn is_network_level(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnreachable(_) | SyncError::NetworkTimeout
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
