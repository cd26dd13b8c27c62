//! Durable local store for not-yet-confirmed domain writes.
//!
//! The single authoritative holder of queued work. Records survive process
//! restarts; any record found mid-transition (`syncing`) at open time is
//! reset to `pending` before anything else runs, so a crash can never
//! strand a record.
//!
//! Each record kind gets its own physical table sharing one row shape;
//! adding a kind means adding a table and an enum arm.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{SyncConfig, DEFAULT_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS};
use crate::db::{self, DbState};
use crate::error::{Result, SyncError};

// ---------------------------------------------------------------------------
// Record model
// ---------------------------------------------------------------------------

/// Kind of queued domain write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Order,
    CashTransaction,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Order, RecordKind::CashTransaction];

    pub fn table(self) -> &'static str {
        match self {
            RecordKind::Order => "pending_orders",
            RecordKind::CashTransaction => "pending_cash_transactions",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Order => "order",
            RecordKind::CashTransaction => "cash_transaction",
        }
    }
}

/// Sync lifecycle status of a queued record.
///
/// `Failed` is terminal here: a retryable failure goes straight back to
/// `Pending` with `attempts` incremented and a backoff window, so `Failed`
/// only ever means the attempt cap was hit and the record needs manual
/// review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(SyncError::LocalStoreCorrupt(format!(
                "unknown status '{other}'"
            ))),
        }
    }
}

/// One queued domain write, keyed by a client-generated idempotency id.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRecord {
    pub client_id: String,
    pub kind: RecordKind,
    pub payload: Value,
    pub status: SyncStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_delay_ms: i64,
}

/// Cheap aggregate for the status surface. Counts only, no payload loads.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PendingCounts {
    pub orders: i64,
    pub cash_transactions: i64,
    pub total: i64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Durable local store over the shared SQLite state.
pub struct Store {
    db: DbState,
    max_attempts: i64,
    retry_delay_ms: i64,
    max_retry_delay_ms: i64,
}

impl Store {
    /// Open the store under `config.data_dir` and run crash recovery.
    pub fn open(config: &SyncConfig) -> Result<Self> {
        let db = db::init(&config.data_dir)?;
        let store = Self::with_db(db, config);
        let recovered = store.recover_interrupted()?;
        if recovered > 0 {
            warn!(recovered, "Reset interrupted syncing records to pending");
        }
        Ok(store)
    }

    /// Wrap an already-initialized database. Callers are responsible for
    /// running `recover_interrupted` before draining.
    pub(crate) fn with_db(db: DbState, config: &SyncConfig) -> Self {
        Self {
            db,
            max_attempts: config.max_attempts,
            retry_delay_ms: config.retry_delay_ms.max(1_000),
            max_retry_delay_ms: config.max_retry_delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS),
        }
    }

    pub(crate) fn db(&self) -> &DbState {
        &self.db
    }

    /// Reset crash artifacts: any `syncing` row reverts to `pending`.
    /// Must run before any other store operation after open.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let mut total = 0;
        for kind in RecordKind::ALL {
            total += conn.execute(
                &format!(
                    "UPDATE {} SET status = 'pending', next_retry_at = NULL
                     WHERE status = 'syncing'",
                    kind.table()
                ),
                [],
            )?;
        }
        Ok(total)
    }

    /// Persist a new record as `pending` and return its client id.
    /// Never touches the network.
    pub fn enqueue(&self, kind: RecordKind, payload: &Value) -> Result<String> {
        let client_id = uuid::Uuid::new_v4().to_string();
        self.enqueue_with_id(kind, &client_id, payload)?;
        Ok(client_id)
    }

    /// Persist under a caller-supplied client id. Used by the write
    /// interceptor so a record enqueued after a failed direct submit keeps
    /// the id the server may already have seen — the idempotency key must
    /// not change between attempts.
    pub fn enqueue_with_id(&self, kind: RecordKind, client_id: &str, payload: &Value) -> Result<()> {
        // Microsecond precision: back-to-back enqueues must not tie on
        // created_at, or oldest-first draining loses the causal order.
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let payload_text = serde_json::to_string(payload)
            .map_err(|e| SyncError::LocalStoreCorrupt(format!("serialize payload: {e}")))?;

        let conn = self.lock_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (client_id, payload, status, attempts, max_attempts,
                                 created_at, retry_delay_ms)
                 VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?5)",
                kind.table()
            ),
            params![
                client_id,
                payload_text,
                self.max_attempts,
                created_at,
                self.retry_delay_ms
            ],
        )?;

        info!(kind = kind.as_str(), client_id = %client_id, "Enqueued record");
        Ok(())
    }

    /// All poppable records, oldest `created_at` first (preserves causal
    /// ordering, e.g. a cash-in before its dependent cash-out). Rows inside
    /// their retry backoff window are not poppable this pass but remain
    /// counted as pending.
    pub fn list_pending(&self, kind: Option<RecordKind>) -> Result<Vec<PendingRecord>> {
        let conn = self.lock_conn()?;
        let kinds: &[RecordKind] = match kind {
            Some(ref k) => std::slice::from_ref(k),
            None => &RecordKind::ALL,
        };

        let mut records = Vec::new();
        for k in kinds {
            records.extend(self.list_pending_in(&conn, *k)?);
        }
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        Ok(records)
    }

    fn list_pending_in(&self, conn: &Connection, kind: RecordKind) -> Result<Vec<PendingRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT client_id, payload, status, attempts, max_attempts, last_error,
                    created_at, synced_at, next_retry_at, COALESCE(retry_delay_ms, 5000)
             FROM {}
             WHERE status = 'pending'
               AND (
                    next_retry_at IS NULL
                    OR julianday(next_retry_at) <= julianday('now')
               )
             ORDER BY created_at ASC",
            kind.table()
        ))?;

        let rows: Vec<RawRow> = stmt
            .query_map([], |row| {
                Ok(RawRow {
                    client_id: row.get(0)?,
                    payload: row.get(1)?,
                    status: row.get(2)?,
                    attempts: row.get(3)?,
                    max_attempts: row.get(4)?,
                    last_error: row.get(5)?,
                    created_at: row.get(6)?,
                    synced_at: row.get(7)?,
                    next_retry_at: row.get(8)?,
                    retry_delay_ms: row.get(9)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for raw in rows {
            match raw.decode(kind) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A single unreadable record must not abort the drain:
                    // mark it failed with a diagnostic and move on.
                    warn!(
                        kind = kind.as_str(),
                        client_id = %raw.client_id,
                        "Corrupt pending record quarantined: {e}"
                    );
                    let _ = conn.execute(
                        &format!(
                            "UPDATE {} SET status = 'failed', last_error = ?1
                             WHERE client_id = ?2 AND status = 'pending'",
                            kind.table()
                        ),
                        params![format!("unreadable record: {e}"), raw.client_id],
                    );
                }
            }
        }
        Ok(records)
    }

    /// Permanently failed records awaiting manual review.
    pub fn list_failed(&self) -> Result<Vec<PendingRecord>> {
        let conn = self.lock_conn()?;
        let mut records = Vec::new();
        for kind in RecordKind::ALL {
            let mut stmt = conn.prepare(&format!(
                "SELECT client_id, payload, status, attempts, max_attempts, last_error,
                        created_at, synced_at, next_retry_at, COALESCE(retry_delay_ms, 5000)
                 FROM {}
                 WHERE status = 'failed'
                 ORDER BY created_at ASC",
                kind.table()
            ))?;
            let rows: Vec<RawRow> = stmt
                .query_map([], |row| {
                    Ok(RawRow {
                        client_id: row.get(0)?,
                        payload: row.get(1)?,
                        status: row.get(2)?,
                        attempts: row.get(3)?,
                        max_attempts: row.get(4)?,
                        last_error: row.get(5)?,
                        created_at: row.get(6)?,
                        synced_at: row.get(7)?,
                        next_retry_at: row.get(8)?,
                        retry_delay_ms: row.get(9)?,
                    })
                })?
                .collect::<std::result::Result<_, _>>()?;
            for raw in rows {
                if let Ok(record) = raw.decode(kind) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Atomic `pending -> syncing` transition. Fails with
    /// `ConcurrentSyncConflict` if the record is not currently `pending`,
    /// which is how two overlapping drains avoid double-processing.
    pub fn mark_syncing(&self, client_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        for kind in RecordKind::ALL {
            let changed = conn.execute(
                &format!(
                    "UPDATE {} SET status = 'syncing'
                     WHERE client_id = ?1 AND status = 'pending'",
                    kind.table()
                ),
                params![client_id],
            )?;
            if changed > 0 {
                return Ok(());
            }
            let exists: Option<String> = conn
                .query_row(
                    &format!("SELECT status FROM {} WHERE client_id = ?1", kind.table()),
                    params![client_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(status) = exists {
                return Err(SyncError::ConcurrentSyncConflict(format!(
                    "{client_id} is {status}, not pending"
                )));
            }
        }
        Err(SyncError::UnknownRecord(client_id.to_string()))
    }

    /// Terminal success: server acknowledged the record (or reported it as
    /// an already-applied duplicate).
    pub fn mark_synced(&self, client_id: &str) -> Result<()> {
        let synced_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.lock_conn()?;
        for kind in RecordKind::ALL {
            let changed = conn.execute(
                &format!(
                    "UPDATE {} SET status = 'synced', synced_at = ?1,
                                   last_error = NULL, next_retry_at = NULL
                     WHERE client_id = ?2",
                    kind.table()
                ),
                params![synced_at, client_id],
            )?;
            if changed > 0 {
                return Ok(());
            }
        }
        Err(SyncError::UnknownRecord(client_id.to_string()))
    }

    /// Record a failed attempt. Below the attempt cap the record re-enters
    /// `pending` with an exponential backoff window; at the cap it becomes
    /// permanently `failed` and is surfaced for manual review, never
    /// silently dropped.
    pub fn mark_failed(&self, client_id: &str, error: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        for kind in RecordKind::ALL {
            let row: Option<(i64, i64, i64)> = conn
                .query_row(
                    &format!(
                        "SELECT attempts, max_attempts, COALESCE(retry_delay_ms, 5000)
                         FROM {} WHERE client_id = ?1",
                        kind.table()
                    ),
                    params![client_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((attempts, max_attempts, retry_delay_ms)) = row else {
                continue;
            };

            let new_attempts = attempts + 1;
            let exhausted = new_attempts >= max_attempts;
            let new_status = if exhausted { "failed" } else { "pending" };
            let next_delay = (retry_delay_ms.max(DEFAULT_RETRY_DELAY_MS) * 2)
                .min(self.max_retry_delay_ms);
            let next_retry_at = if exhausted {
                None
            } else {
                Some(schedule_next_retry(next_delay, jitter_seed(client_id)))
            };

            conn.execute(
                &format!(
                    "UPDATE {} SET status = ?1, attempts = ?2, next_retry_at = ?3,
                                   retry_delay_ms = ?4, last_error = ?5
                     WHERE client_id = ?6",
                    kind.table()
                ),
                params![
                    new_status,
                    new_attempts,
                    next_retry_at,
                    next_delay,
                    error,
                    client_id
                ],
            )?;

            if exhausted {
                warn!(
                    kind = kind.as_str(),
                    client_id = %client_id,
                    attempts = new_attempts,
                    "Record permanently failed; awaiting manual review"
                );
            }
            return Ok(());
        }
        Err(SyncError::UnknownRecord(client_id.to_string()))
    }

    /// Requeue one permanently failed record after operator intervention.
    pub fn retry_failed(&self, client_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        for kind in RecordKind::ALL {
            let changed = conn.execute(
                &format!(
                    "UPDATE {} SET status = 'pending', attempts = 0,
                                   last_error = NULL, next_retry_at = NULL,
                                   retry_delay_ms = ?1
                     WHERE client_id = ?2 AND status = 'failed'",
                    kind.table()
                ),
                params![self.retry_delay_ms, client_id],
            )?;
            if changed > 0 {
                info!(client_id = %client_id, "Requeued failed record");
                return Ok(());
            }
        }
        Err(SyncError::UnknownRecord(client_id.to_string()))
    }

    /// Requeue every permanently failed record. Returns how many.
    pub fn retry_all_failed(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let mut total = 0;
        for kind in RecordKind::ALL {
            total += conn.execute(
                &format!(
                    "UPDATE {} SET status = 'pending', attempts = 0,
                                   last_error = NULL, next_retry_at = NULL,
                                   retry_delay_ms = ?1
                     WHERE status = 'failed'",
                    kind.table()
                ),
                params![self.retry_delay_ms],
            )?;
        }
        if total > 0 {
            info!(total, "Requeued all failed records");
        }
        Ok(total)
    }

    /// Unsynced-work aggregate. COUNT(*) only; payloads are never loaded.
    pub fn pending_counts(&self) -> Result<PendingCounts> {
        let conn = self.lock_conn()?;
        let orders = count_unsynced(&conn, RecordKind::Order)?;
        let cash_transactions = count_unsynced(&conn, RecordKind::CashTransaction)?;
        Ok(PendingCounts {
            orders,
            cash_transactions,
            total: orders + cash_transactions,
        })
    }

    /// Count of permanently failed records (manual-review bucket).
    pub fn failed_count(&self) -> Result<i64> {
        let conn = self.lock_conn()?;
        let mut total = 0;
        for kind in RecordKind::ALL {
            total += conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE status = 'failed'",
                    kind.table()
                ),
                [],
                |row| row.get::<_, i64>(0),
            )?;
        }
        Ok(total)
    }

    /// Retention sweep: delete `synced` records older than the window.
    /// Synced records are never re-sent, so this only trims audit history.
    pub fn purge_synced(&self, older_than: Duration) -> Result<usize> {
        let cutoff = (Utc::now()
            - ChronoDuration::from_std(older_than).unwrap_or(ChronoDuration::zero()))
        .to_rfc3339_opts(SecondsFormat::Millis, true);

        let conn = self.lock_conn()?;
        let mut total = 0;
        for kind in RecordKind::ALL {
            total += conn.execute(
                &format!(
                    "DELETE FROM {} WHERE status = 'synced' AND synced_at < ?1",
                    kind.table()
                ),
                params![cutoff],
            )?;
        }
        if total > 0 {
            info!(purged = total, "Retention sweep removed synced records");
        }
        Ok(total)
    }

    /// Fetch one record by client id, whichever table holds it.
    pub fn get(&self, client_id: &str) -> Result<Option<PendingRecord>> {
        let conn = self.lock_conn()?;
        for kind in RecordKind::ALL {
            let raw: Option<RawRow> = conn
                .query_row(
                    &format!(
                        "SELECT client_id, payload, status, attempts, max_attempts, last_error,
                                created_at, synced_at, next_retry_at, COALESCE(retry_delay_ms, 5000)
                         FROM {} WHERE client_id = ?1",
                        kind.table()
                    ),
                    params![client_id],
                    |row| {
                        Ok(RawRow {
                            client_id: row.get(0)?,
                            payload: row.get(1)?,
                            status: row.get(2)?,
                            attempts: row.get(3)?,
                            max_attempts: row.get(4)?,
                            last_error: row.get(5)?,
                            created_at: row.get(6)?,
                            synced_at: row.get(7)?,
                            next_retry_at: row.get(8)?,
                            retry_delay_ms: row.get(9)?,
                        })
                    },
                )
                .optional()?;
            if let Some(raw) = raw {
                return raw.decode(kind).map(Some);
            }
        }
        Ok(None)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db.conn.lock().map_err(|e| {
            SyncError::LocalStoreCorrupt(format!("connection mutex poisoned: {e}"))
        })
    }
}

fn count_unsynced(conn: &Connection, kind: RecordKind) -> Result<i64> {
    let count = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE status IN ('pending', 'syncing')",
            kind.table()
        ),
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Backoff scheduling
// ---------------------------------------------------------------------------

fn jitter_seed(client_id: &str) -> i64 {
    let digest = md5::compute(client_id.as_bytes());
    i64::from_le_bytes(digest.0[..8].try_into().unwrap_or([0; 8]))
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = if seed < 0 { seed.wrapping_neg() } else { seed };
    (positive % 700) + 50
}

fn schedule_next_retry(delay_ms: i64, seed: i64) -> String {
    let bounded = delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS);
    let jitter = deterministic_jitter_ms(seed);
    (Utc::now() + ChronoDuration::milliseconds(bounded + jitter))
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

struct RawRow {
    client_id: String,
    payload: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    last_error: Option<String>,
    created_at: String,
    synced_at: Option<String>,
    next_retry_at: Option<String>,
    retry_delay_ms: i64,
}

impl RawRow {
    fn decode(&self, kind: RecordKind) -> Result<PendingRecord> {
        let payload: Value = serde_json::from_str(&self.payload).map_err(|e| {
            SyncError::LocalStoreCorrupt(format!("{}: bad payload JSON: {e}", self.client_id))
        })?;
        let created_at = parse_ts(&self.created_at).ok_or_else(|| {
            SyncError::LocalStoreCorrupt(format!(
                "{}: bad created_at '{}'",
                self.client_id, self.created_at
            ))
        })?;

        Ok(PendingRecord {
            client_id: self.client_id.clone(),
            kind,
            payload,
            status: SyncStatus::parse(&self.status)?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            last_error: self.last_error.clone(),
            created_at,
            synced_at: self.synced_at.as_deref().and_then(parse_ts),
            next_retry_at: self.next_retry_at.as_deref().and_then(parse_ts),
            retry_delay_ms: self.retry_delay_ms,
        })
    }
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    pub(crate) fn test_store() -> Store {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        let db = DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        };
        Store::with_db(db, &SyncConfig::new("pos.example.com", "/tmp/unused"))
    }

    #[test]
    fn test_enqueue_and_list_pending_oldest_first() {
        let store = test_store();
        let a = store
            .enqueue(RecordKind::Order, &json!({"total": 10.0}))
            .unwrap();
        let b = store
            .enqueue(RecordKind::CashTransaction, &json!({"amount": -5.0}))
            .unwrap();
        let c = store
            .enqueue(RecordKind::Order, &json!({"total": 20.0}))
            .unwrap();

        let pending = store.list_pending(None).unwrap();
        assert_eq!(pending.len(), 3);
        // created_at ascending regardless of kind
        let ids: Vec<&str> = pending.iter().map(|r| r.client_id.as_str()).collect();
        assert_eq!(ids, vec![a.as_str(), b.as_str(), c.as_str()]);

        let orders_only = store.list_pending(Some(RecordKind::Order)).unwrap();
        assert_eq!(orders_only.len(), 2);
        assert!(orders_only.iter().all(|r| r.kind == RecordKind::Order));
    }

    #[test]
    fn test_pending_counts_without_payload_load() {
        let store = test_store();
        store.enqueue(RecordKind::Order, &json!({})).unwrap();
        store.enqueue(RecordKind::Order, &json!({})).unwrap();
        store
            .enqueue(RecordKind::CashTransaction, &json!({}))
            .unwrap();

        let counts = store.pending_counts().unwrap();
        assert_eq!(counts.orders, 2);
        assert_eq!(counts.cash_transactions, 1);
        assert_eq!(counts.total, 3);
    }

    #[test]
    fn test_mark_syncing_is_a_compare_and_set() {
        let store = test_store();
        let id = store.enqueue(RecordKind::Order, &json!({})).unwrap();

        store.mark_syncing(&id).expect("first transition");

        // Second transition must fail, not silently overwrite.
        let second = store.mark_syncing(&id);
        assert!(matches!(
            second,
            Err(SyncError::ConcurrentSyncConflict(_))
        ));

        let unknown = store.mark_syncing("no-such-id");
        assert!(matches!(unknown, Err(SyncError::UnknownRecord(_))));
    }

    #[test]
    fn test_mark_synced_is_terminal() {
        let store = test_store();
        let id = store.enqueue(RecordKind::Order, &json!({})).unwrap();
        store.mark_syncing(&id).unwrap();
        store.mark_synced(&id).unwrap();

        let record = store.get(&id).unwrap().expect("record exists");
        assert_eq!(record.status, SyncStatus::Synced);
        assert!(record.synced_at.is_some());

        // Synced records are never poppable again.
        assert!(store.list_pending(None).unwrap().is_empty());
        assert!(matches!(
            store.mark_syncing(&id),
            Err(SyncError::ConcurrentSyncConflict(_))
        ));
    }

    #[test]
    fn test_mark_failed_backoff_then_permanent() {
        let store = test_store();
        let id = store.enqueue(RecordKind::Order, &json!({})).unwrap();

        // Attempts 1..4: retryable, back to pending with a backoff window.
        for attempt in 1..5 {
            store.mark_syncing(&id).unwrap();
            store.mark_failed(&id, "HTTP 503").unwrap();
            let record = store.get(&id).unwrap().unwrap();
            assert_eq!(record.attempts, attempt);
            assert_eq!(record.status, SyncStatus::Pending);
            assert!(record.next_retry_at.is_some());
            assert_eq!(record.last_error.as_deref(), Some("HTTP 503"));

            // Not poppable while inside the backoff window...
            assert!(store.list_pending(None).unwrap().is_empty());
            // ...but still counted as unsynced work.
            assert_eq!(store.pending_counts().unwrap().total, 1);

            // Elapse the window so the next pass can pop it.
            clear_backoff(&store, &id);
            assert_eq!(store.list_pending(None).unwrap().len(), 1);
        }

        // Attempt 5 hits the cap: permanently failed, surfaced, not dropped.
        store.mark_syncing(&id).unwrap();
        store.mark_failed(&id, "HTTP 503").unwrap();
        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::Failed);
        assert_eq!(record.attempts, 5);
        assert!(store.list_pending(None).unwrap().is_empty());
        assert_eq!(store.failed_count().unwrap(), 1);
        assert_eq!(store.list_failed().unwrap().len(), 1);
    }

    #[test]
    fn test_retry_failed_requeues_for_another_round() {
        let store = test_store();
        let id = store.enqueue(RecordKind::CashTransaction, &json!({})).unwrap();
        for _ in 0..5 {
            clear_backoff(&store, &id);
            store.mark_syncing(&id).unwrap();
            store.mark_failed(&id, "validation failed").unwrap();
        }
        assert_eq!(store.failed_count().unwrap(), 1);

        store.retry_failed(&id).unwrap();
        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.last_error.is_none());
        assert_eq!(store.list_pending(None).unwrap().len(), 1);
    }

    #[test]
    fn test_recover_interrupted_resets_syncing_rows() {
        let store = test_store();
        let id = store.enqueue(RecordKind::Order, &json!({})).unwrap();
        store.mark_syncing(&id).unwrap();

        // Simulates process restart after a crash mid-drain.
        let recovered = store.recover_interrupted().unwrap();
        assert_eq!(recovered, 1);

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(store.list_pending(None).unwrap().len(), 1);
    }

    #[test]
    fn test_purge_synced_respects_retention() {
        let store = test_store();
        let old_id = store.enqueue(RecordKind::Order, &json!({})).unwrap();
        let new_id = store.enqueue(RecordKind::Order, &json!({})).unwrap();
        store.mark_syncing(&old_id).unwrap();
        store.mark_synced(&old_id).unwrap();
        store.mark_syncing(&new_id).unwrap();
        store.mark_synced(&new_id).unwrap();

        // Age one record past the retention cutoff.
        {
            let conn = store.db.conn.lock().unwrap();
            conn.execute(
                "UPDATE pending_orders SET synced_at = '2020-01-01T00:00:00.000Z'
                 WHERE client_id = ?1",
                params![old_id],
            )
            .unwrap();
        }

        let purged = store.purge_synced(Duration::from_secs(7 * 24 * 3600)).unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(&old_id).unwrap().is_none());
        assert!(store.get(&new_id).unwrap().is_some());
    }

    #[test]
    fn test_corrupt_payload_is_quarantined_not_fatal() {
        let store = test_store();
        let good = store.enqueue(RecordKind::Order, &json!({"ok": true})).unwrap();
        let bad = store.enqueue(RecordKind::Order, &json!({})).unwrap();
        {
            let conn = store.db.conn.lock().unwrap();
            conn.execute(
                "UPDATE pending_orders SET payload = 'not json' WHERE client_id = ?1",
                params![bad],
            )
            .unwrap();
        }

        let pending = store.list_pending(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].client_id, good);

        let quarantined = store.get(&bad);
        assert!(matches!(quarantined, Err(SyncError::LocalStoreCorrupt(_))));
        assert_eq!(store.failed_count().unwrap(), 1);
    }

    pub(crate) fn clear_backoff(store: &Store, client_id: &str) {
        let conn = store.db.conn.lock().unwrap();
        for kind in RecordKind::ALL {
            let _ = conn.execute(
                &format!(
                    "UPDATE {} SET next_retry_at = NULL WHERE client_id = ?1",
                    kind.table()
                ),
                params![client_id],
            );
        }
    }
}
