//! Write-ahead log for order-submission durability (§4.6).
//!
//! An order intent is durably recorded before it is ever sent to the
//! terminal, so a crash between "sent" and "response received" can be
//! recovered from by re-querying the terminal for the embedded request id
//! (§3, §4.7) instead of blindly resubmitting. Backed by an embedded SQLite
//! file opened in WAL journal mode, with all access funneled through
//! `tokio::task::spawn_blocking` since `rusqlite` is synchronous — the same
//! bridge the teacher's reconnect examples use for blocking I/O inside an
//! async runtime.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::BridgeError;

/// Lifecycle state of a WAL entry (§4.6). `Pending` and `Sent` are
/// non-terminal; `Verified`, `Failed`, and `Recovered` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Sent,
    Verified,
    Failed,
    Recovered,
}

impl EntryStatus {
    fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Sent => "sent",
            EntryStatus::Verified => "verified",
            EntryStatus::Failed => "failed",
            EntryStatus::Recovered => "recovered",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EntryStatus::Pending),
            "sent" => Some(EntryStatus::Sent),
            "verified" => Some(EntryStatus::Verified),
            "failed" => Some(EntryStatus::Failed),
            "recovered" => Some(EntryStatus::Recovered),
            _ => None,
        }
    }

    /// Terminal states are never revisited and are eligible for cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryStatus::Verified | EntryStatus::Failed | EntryStatus::Recovered
        )
    }
}

/// A single order-lifecycle record (§4.6).
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub request_id: String,
    pub operation: String,
    pub payload: String,
    pub status: EntryStatus,
    pub retcode: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Write-ahead log for critical order submissions.
///
/// All public methods are no-ops (returning `Ok(())` / `Ok(None)`) when
/// constructed with [`Wal::disabled`] — orchestrator callers never need to
/// branch on whether a WAL is configured.
pub struct Wal {
    conn: Option<Arc<AsyncMutex<Connection>>>,
    retention_days: i64,
}

impl Wal {
    /// Opens (creating if needed) a SQLite-backed WAL at `path`, in WAL
    /// journal mode, with the order-lifecycle table ensured to exist.
    pub async fn open(path: PathBuf, retention_days: i64) -> Result<Self, BridgeError> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, BridgeError> {
            let conn = Connection::open(path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS wal_entries (
                    request_id TEXT PRIMARY KEY,
                    operation  TEXT NOT NULL,
                    payload    TEXT NOT NULL,
                    status     TEXT NOT NULL,
                    retcode    INTEGER,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )?;
            Ok(conn)
        })
        .await
        .map_err(|e| BridgeError::Operation(format!("wal init task panicked: {e}")))??;

        Ok(Self {
            conn: Some(Arc::new(AsyncMutex::new(conn))),
            retention_days,
        })
    }

    /// A WAL that performs no I/O; every operation is a no-op. Used when
    /// `enable_auto_reconnect`-adjacent durability is disabled in config.
    pub fn disabled() -> Self {
        Self {
            conn: None,
            retention_days: 0,
        }
    }

    /// Records a PENDING entry for a not-yet-sent order (§4.7 step 1).
    pub async fn log_intent(
        &self,
        request_id: &str,
        operation: &str,
        payload: &str,
    ) -> Result<(), BridgeError> {
        debug!(request_id, operation, status = "pending", "wal transition");
        let Some(conn) = &self.conn else { return Ok(()) };
        let now = now_rfc3339();
        let (request_id, operation, payload) =
            (request_id.to_string(), operation.to_string(), payload.to_string());
        let conn = conn.clone();
        run_blocking(conn, move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO wal_entries
                     (request_id, operation, payload, status, retcode, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', NULL, ?4, ?4)",
                params![request_id, operation, payload, now],
            )?;
            Ok(())
        })
        .await
    }

    /// Transitions an entry to SENT, just before the RPC is issued.
    pub async fn mark_sent(&self, request_id: &str) -> Result<(), BridgeError> {
        self.set_status(request_id, EntryStatus::Sent, None).await
    }

    /// Transitions an entry to VERIFIED (terminal): the order is confirmed
    /// executed.
    pub async fn mark_verified(&self, request_id: &str, retcode: Option<i32>) -> Result<(), BridgeError> {
        self.set_status(request_id, EntryStatus::Verified, retcode).await
    }

    /// Transitions an entry to FAILED (terminal): the order is confirmed not
    /// executed, or was permanently refused.
    pub async fn mark_failed(&self, request_id: &str, retcode: Option<i32>) -> Result<(), BridgeError> {
        self.set_status(request_id, EntryStatus::Failed, retcode).await
    }

    /// Transitions an entry to RECOVERED (terminal): a startup recovery
    /// pass resolved an ambiguous SENT entry left over from a crash.
    pub async fn mark_recovered(&self, request_id: &str, retcode: Option<i32>) -> Result<(), BridgeError> {
        self.set_status(request_id, EntryStatus::Recovered, retcode).await
    }

    async fn set_status(
        &self,
        request_id: &str,
        status: EntryStatus,
        retcode: Option<i32>,
    ) -> Result<(), BridgeError> {
        debug!(request_id, status = status.as_str(), ?retcode, "wal transition");
        let Some(conn) = &self.conn else { return Ok(()) };
        let now = now_rfc3339();
        let request_id = request_id.to_string();
        let status_str = status.as_str();
        let conn = conn.clone();
        run_blocking(conn, move |conn| {
            conn.execute(
                "UPDATE wal_entries SET status = ?1, retcode = ?2, updated_at = ?3 WHERE request_id = ?4",
                params![status_str, retcode, now, request_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Fetches a single entry by request id.
    pub async fn get_entry(&self, request_id: &str) -> Result<Option<WalEntry>, BridgeError> {
        let Some(conn) = &self.conn else { return Ok(None) };
        let request_id = request_id.to_string();
        let conn = conn.clone();
        run_blocking(conn, move |conn| {
            conn.query_row(
                "SELECT request_id, operation, payload, status, retcode, created_at, updated_at
                 FROM wal_entries WHERE request_id = ?1",
                params![request_id],
                row_to_entry,
            )
            .optional()
            .map_err(BridgeError::from)
        })
        .await
    }

    /// Returns every entry left in a non-terminal state (PENDING or SENT),
    /// oldest first — candidates for crash recovery on startup (§4.6).
    pub async fn get_incomplete(&self) -> Result<Vec<WalEntry>, BridgeError> {
        let Some(conn) = &self.conn else { return Ok(Vec::new()) };
        let conn = conn.clone();
        run_blocking(conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, operation, payload, status, retcode, created_at, updated_at
                 FROM wal_entries WHERE status IN ('pending', 'sent')
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([], row_to_entry)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Deletes terminal entries older than `retention_days`; never touches
    /// PENDING or SENT entries regardless of age.
    pub async fn cleanup_old(&self) -> Result<usize, BridgeError> {
        let Some(conn) = &self.conn else { return Ok(0) };
        let cutoff = (Utc::now() - chrono::Duration::days(self.retention_days)).to_rfc3339();
        let conn = conn.clone();
        run_blocking(conn, move |conn| {
            let deleted = conn.execute(
                "DELETE FROM wal_entries
                 WHERE status IN ('verified', 'failed', 'recovered') AND updated_at < ?1",
                params![cutoff],
            )?;
            Ok(deleted)
        })
        .await
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<WalEntry> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(WalEntry {
        request_id: row.get(0)?,
        operation: row.get(1)?,
        payload: row.get(2)?,
        status: EntryStatus::from_str(&status).unwrap_or(EntryStatus::Pending),
        retcode: row.get(4)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Single-writer-lock serialization: every WAL mutation takes the same
/// async mutex before the blocking task runs, so statements are never
/// interleaved across connections even though SQLite itself would allow it
/// in WAL mode.
async fn run_blocking<T, F>(conn: Arc<AsyncMutex<Connection>>, f: F) -> Result<T, BridgeError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, BridgeError> + Send + 'static,
{
    let guard = conn.lock_owned().await;
    tokio::task::spawn_blocking(move || f(&guard))
        .await
        .map_err(|e| BridgeError::Operation(format!("wal task panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn open_test_wal() -> Wal {
        let file = NamedTempFile::new().unwrap();
        Wal::open(file.path().to_path_buf(), 7).await.unwrap()
    }

    #[tokio::test]
    async fn full_lifecycle_pending_to_verified() {
        let wal = open_test_wal().await;
        wal.log_intent("RQ0000000000000001", "order_send", "{}")
            .await
            .unwrap();
        let entry = wal.get_entry("RQ0000000000000001").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);

        wal.mark_sent("RQ0000000000000001").await.unwrap();
        let entry = wal.get_entry("RQ0000000000000001").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Sent);

        wal.mark_verified("RQ0000000000000001", Some(10009))
            .await
            .unwrap();
        let entry = wal.get_entry("RQ0000000000000001").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Verified);
        assert_eq!(entry.retcode, Some(10009));
    }

    #[tokio::test]
    async fn incomplete_entries_cover_both_pending_and_sent() {
        let wal = open_test_wal().await;
        wal.log_intent("RQ0000000000000001", "order_send", "{}")
            .await
            .unwrap();
        wal.log_intent("RQ0000000000000002", "order_send", "{}")
            .await
            .unwrap();
        wal.mark_sent("RQ0000000000000001").await.unwrap();

        let incomplete = wal.get_incomplete().await.unwrap();
        assert_eq!(incomplete.len(), 2);
        assert_eq!(incomplete[0].request_id, "RQ0000000000000001");
        assert_eq!(incomplete[1].request_id, "RQ0000000000000002");

        wal.mark_verified("RQ0000000000000002", Some(10009))
            .await
            .unwrap();
        let incomplete = wal.get_incomplete().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].request_id, "RQ0000000000000001");
    }

    #[tokio::test]
    async fn cleanup_never_deletes_pending_or_sent_entries() {
        let wal = open_test_wal().await;
        wal.log_intent("RQ0000000000000001", "order_send", "{}")
            .await
            .unwrap();
        wal.mark_sent("RQ0000000000000001").await.unwrap();

        let deleted = wal.cleanup_old().await.unwrap();
        assert_eq!(deleted, 0);
        assert!(wal.get_entry("RQ0000000000000001").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn disabled_wal_is_a_no_op() {
        let wal = Wal::disabled();
        wal.log_intent("RQ0000000000000001", "order_send", "{}")
            .await
            .unwrap();
        assert!(wal.get_entry("RQ0000000000000001").await.unwrap().is_none());
        assert_eq!(wal.get_incomplete().await.unwrap().len(), 0);
        assert_eq!(wal.cleanup_old().await.unwrap(), 0);
    }
}
