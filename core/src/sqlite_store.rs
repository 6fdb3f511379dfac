//! SQLite-backed store
//!
//! Each [`SqliteStore`] value is one session against a shared database file.
//! Named locks live in the `named_locks` table and are tied to the session
//! that inserted them:
//! - dropping the store deletes every lock the session holds
//! - a lock whose holder process is gone (same host, dead pid) is reclaimed
//!   by the next session that asks for it
//!
//! A row left by a crashed process on another host, or in another pid
//! namespace that reports the same host name, is never reclaimed. Delete it
//! by hand once the holder is known to be dead:
//!
//! ```sql
//! DELETE FROM named_locks WHERE name = 'refsync_openemr_RXNORM';
//! ```
//!
//! Statements run on tokio's blocking pool so a busy database never stalls
//! the runtime.

use crate::category::Category;
use crate::errors::{RefSyncError, Result, StoreError};
use crate::store::{
    DatasetRevision, Ledger, LockAttempt, LockHolderId, LockStore, SupportedDataset,
    TrackingRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Embedded schema SQL from REFSYNC_SCHEMA.sql
const SCHEMA_SQL: &str = include_str!("../REFSYNC_SCHEMA.sql");

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Interval between lock polls while another session holds the lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long a statement waits on SQLite's own write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Instance id used when the db path has no usable file stem.
const FALLBACK_INSTANCE_ID: &str = "refsync";

/// Who owns the locks this store takes.
#[derive(Debug)]
struct Session {
    id: String,
    pid: u32,
    host: String,
}

impl Session {
    fn label(&self) -> LockHolderId {
        holder_label(&self.id, i64::from(self.pid), &self.host)
    }
}

/// Result of one pass over `named_locks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Take {
    Taken,
    HeldByOther,
    /// Another connection held SQLite's write lock past the busy timeout
    Busy,
}

/// One session against a SQLite database file.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    instance_id: String,
    session: Arc<Session>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    ///
    /// `instance_id` names the store in lock names; `None` uses the file stem.
    pub fn open(path: &Path, instance_id: Option<&str>) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                RefSyncError::io(
                    format!("failed to create db directory: {}", parent.display()),
                    e,
                )
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            RefSyncError::store(
                "database open",
                None,
                StoreError::query(format!("failed to open db at {}", path.display()), e),
            )
        })?;

        let instance_id = instance_id.map(str::to_string).unwrap_or_else(|| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or(FALLBACK_INSTANCE_ID)
                .to_string()
        });

        let store = Self::from_connection(conn, instance_id)?;
        tracing::debug!(
            path = %path.display(),
            instance = %store.instance_id,
            session = %store.session.id,
            "SQLite store opened"
        );
        Ok(store)
    }

    /// Connect to an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory(instance_id: &str) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            RefSyncError::store(
                "database open",
                None,
                StoreError::query("failed to open in-memory db", e),
            )
        })?;
        Self::from_connection(conn, instance_id.to_string())
    }

    fn from_connection(conn: Connection, instance_id: String) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .and_then(|()| conn.execute_batch(SCHEMA_SQL))
            .map_err(|e| {
                RefSyncError::store(
                    "schema setup",
                    None,
                    StoreError::query("failed to apply schema", e),
                )
            })?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            instance_id,
            session: Arc::new(Session {
                id: uuid::Uuid::new_v4().to_string(),
                pid: std::process::id(),
                host: current_host(),
            }),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn holder_label(&self) -> LockHolderId {
        self.session.label()
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_connection<F, T>(&self, f: F) -> std::result::Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> std::result::Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::query("database task", e))?
    }

    /// Delete every lock held by this session.
    fn release_all(&self) -> std::result::Result<usize, StoreError> {
        self.conn()
            .execute(
                "DELETE FROM named_locks WHERE session_id = ?1",
                params![self.session.id],
            )
            .map_err(|e| StoreError::query("release session locks", e))
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        match self.release_all() {
            Ok(0) => {}
            Ok(released) => {
                tracing::debug!(session = %self.session.id, released, "Session closed, locks released")
            }
            Err(err) => tracing::warn!(
                session = %self.session.id,
                error = %err,
                "Failed to release session locks on close"
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// named_locks
// ─────────────────────────────────────────────────────────────────────────────

/// Take `name` if it is free, already ours, or held by a dead process.
///
/// SQLite's write lock is waited on for at most `busy_wait`.
fn try_take(
    conn: &mut Connection,
    session: &Session,
    name: &str,
    busy_wait: Duration,
) -> std::result::Result<Take, StoreError> {
    conn.busy_timeout(busy_wait)
        .map_err(|e| StoreError::query("set busy timeout", e))?;
    let result = take_in_transaction(conn, session, name);
    if let Err(err) = conn.busy_timeout(BUSY_TIMEOUT) {
        tracing::debug!(error = %err, "Could not restore busy timeout");
    }

    match result {
        Ok(take) => Ok(take),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) =>
        {
            Ok(Take::Busy)
        }
        Err(err) => Err(StoreError::query("take named lock", err)),
    }
}

fn take_in_transaction(
    conn: &mut Connection,
    session: &Session,
    name: &str,
) -> rusqlite::Result<Take> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing: Option<(String, i64, String)> = tx
        .query_row(
            "SELECT session_id, pid, host FROM named_locks WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    match existing {
        Some((holder, ..)) if holder == session.id => return Ok(Take::Taken),
        Some((holder, pid, host)) => {
            if !holder_is_gone(&host, pid) {
                return Ok(Take::HeldByOther);
            }
            tracing::warn!(
                lock = name,
                stale_session = %holder,
                stale_pid = pid,
                host = %host,
                "Reclaiming lock from a process that no longer exists"
            );
            tx.execute("DELETE FROM named_locks WHERE name = ?1", params![name])?;
        }
        None => {}
    }

    tx.execute(
        "INSERT INTO named_locks (name, session_id, pid, host, acquired_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            name,
            session.id,
            i64::from(session.pid),
            session.host,
            Utc::now().to_rfc3339()
        ],
    )?;
    tx.commit()?;
    Ok(Take::Taken)
}

#[async_trait]
impl LockStore for SqliteStore {
    fn instance_id(&self) -> String {
        self.instance_id.clone()
    }

    async fn acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> std::result::Result<LockAttempt, StoreError> {
        let deadline = Instant::now() + timeout;
        let mut contended = false;
        loop {
            let busy_wait = deadline
                .saturating_duration_since(Instant::now())
                .min(BUSY_TIMEOUT);
            let session = Arc::clone(&self.session);
            let lock_name = name.to_string();
            let take = self
                .with_connection(move |conn| try_take(conn, &session, &lock_name, busy_wait))
                .await?;

            match take {
                Take::Taken if contended => return Ok(LockAttempt::GrantedAfterWait),
                Take::Taken => return Ok(LockAttempt::Granted),
                Take::HeldByOther => contended = true,
                Take::Busy => tracing::debug!(lock = name, "Database busy while taking lock"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(LockAttempt::Held);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn release(&self, name: &str) -> std::result::Result<(), StoreError> {
        let session = Arc::clone(&self.session);
        let lock_name = name.to_string();
        let deleted = self
            .with_connection(move |conn| {
                conn.execute(
                    "DELETE FROM named_locks WHERE name = ?1 AND session_id = ?2",
                    params![lock_name, session.id],
                )
                .map_err(|e| StoreError::query("release lock", e))
            })
            .await?;
        if deleted == 0 {
            tracing::debug!(lock = name, session = %self.session.id, "Release of a lock not held");
        }
        Ok(())
    }

    async fn current_holder(
        &self,
        name: &str,
    ) -> std::result::Result<Option<LockHolderId>, StoreError> {
        let lock_name = name.to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT session_id, pid, host FROM named_locks WHERE name = ?1",
                params![lock_name],
                |row| {
                    let session: String = row.get(0)?;
                    let pid: i64 = row.get(1)?;
                    let host: String = row.get(2)?;
                    Ok(holder_label(&session, pid, &host))
                },
            )
            .optional()
            .map_err(|e| StoreError::query("read lock holder", e))
        })
        .await
    }

    async fn session_id(&self) -> std::result::Result<LockHolderId, StoreError> {
        Ok(self.holder_label())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl Ledger for SqliteStore {
    async fn exists_exact(
        &self,
        category: Category,
        revision_date: NaiveDate,
        version_label: &str,
        checksum: &str,
    ) -> std::result::Result<bool, StoreError> {
        let version_label = version_label.to_string();
        let checksum = checksum.to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM tracking_records
                    WHERE category = ?1 AND revision_date = ?2
                      AND version_label = ?3 AND checksum = ?4
                )
                "#,
                params![
                    category.as_str(),
                    revision_date.format(DATE_FORMAT).to_string(),
                    version_label,
                    checksum
                ],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::query("exact-match lookup", e))
        })
        .await
    }

    async fn exists_any(&self, category: Category) -> std::result::Result<bool, StoreError> {
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM tracking_records WHERE category = ?1)",
                params![category.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::query("category lookup", e))
        })
        .await
    }

    async fn insert(&self, record: &TrackingRecord) -> std::result::Result<(), StoreError> {
        let record = record.clone();
        self.with_connection(move |conn| {
            conn.execute(
                r#"
                INSERT INTO tracking_records
                    (category, revision_date, version_label, checksum, loaded_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    record.category.as_str(),
                    record
                        .revision_date
                        .map(|date| date.format(DATE_FORMAT).to_string()),
                    record.version_label,
                    record.checksum,
                    record.loaded_at.to_rfc3339()
                ],
            )
            .map_err(|e| StoreError::query("insert tracking record", e))?;
            Ok(())
        })
        .await
    }

    async fn lookup_by_filename_and_checksum(
        &self,
        category: Category,
        filename: &str,
        checksum: &str,
    ) -> std::result::Result<Option<DatasetRevision>, StoreError> {
        let filename = filename.to_string();
        let checksum = checksum.to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                r#"
                SELECT revision_date, version_label FROM supported_datasets
                WHERE category = ?1 AND filename = ?2 AND checksum = ?3
                "#,
                params![category.as_str(), filename, checksum],
                |row| {
                    Ok(DatasetRevision {
                        revision_date: parse_date_column(row.get(0)?, 0)?,
                        version_label: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::query("supported dataset lookup", e))
        })
        .await
    }

    async fn records(
        &self,
        category: Option<Category>,
    ) -> std::result::Result<Vec<TrackingRecord>, StoreError> {
        self.with_connection(move |conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT category, revision_date, version_label, checksum, loaded_at
                    FROM tracking_records
                    WHERE ?1 IS NULL OR category = ?1
                    ORDER BY id DESC
                    "#,
                )
                .map_err(|e| StoreError::query("prepare records query", e))?;

            let rows = stmt
                .query_map(params![category.map(|c| c.as_str())], read_record)
                .map_err(|e| StoreError::query("query records", e))?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| StoreError::query("read records", e))
        })
        .await
    }

    async fn register_dataset(
        &self,
        dataset: &SupportedDataset,
    ) -> std::result::Result<(), StoreError> {
        let dataset = dataset.clone();
        self.with_connection(move |conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO supported_datasets
                    (category, filename, checksum, revision_date, version_label)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    dataset.category.as_str(),
                    dataset.filename,
                    dataset.checksum,
                    dataset.revision.revision_date.format(DATE_FORMAT).to_string(),
                    dataset.revision.version_label
                ],
            )
            .map_err(|e| StoreError::query("register dataset", e))?;
            Ok(())
        })
        .await
    }
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackingRecord> {
    let label: String = row.get(0)?;
    let category = Category::parse(&label).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Text,
            Box::new(crate::category::UnknownCategory(label)),
        )
    })?;
    let revision_date = row
        .get::<_, Option<String>>(1)?
        .map(|text| parse_date_column(text, 1))
        .transpose()?;
    let loaded_at: String = row.get(4)?;
    let loaded_at = DateTime::parse_from_rfc3339(&loaded_at)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);
    Ok(TrackingRecord {
        category,
        revision_date,
        version_label: row.get(2)?,
        checksum: row.get(3)?,
        loaded_at,
    })
}

fn parse_date_column(text: String, column: usize) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&text, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn holder_label(session: &str, pid: i64, host: &str) -> LockHolderId {
    LockHolderId(format!("session {session} (pid {pid} on {host})"))
}

fn current_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// A holder is gone only if it ran on this host and its pid no longer exists.
fn holder_is_gone(host: &str, pid: i64) -> bool {
    if host != current_host() {
        return false;
    }
    match u32::try_from(pid) {
        Ok(pid) => !is_process_running(pid),
        Err(_) => true,
    }
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // kill(pid, 0) checks for existence; EPERM means it exists under another user.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    // Can't check on this platform, assume running
    true
}
