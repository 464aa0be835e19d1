//! Job record storage.
//!
//! Provides the storage primitives the queue engine is built on, and a
//! SQLite-backed implementation of them.

use super::error::QueueResult;
use super::models::{JobId, JobRecord, NewJobRecord, QueueStats};
use super::schema::JOB_QUEUE_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::migrate_to_latest;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

const JOB_COLUMNS: &str = "id, queue, payload, attempts, reserved_at, available_at, created_at";

/// Operations available while holding the store's write lock.
///
/// Everything done through one `JobTransaction` commits atomically, and no
/// other transaction can read-then-write the same rows until it does.
pub trait JobTransaction {
    /// Reads the first claimable row of `queue`, ordered by attempts then id.
    ///
    /// A row is claimable when it is not reserved and `available_at <= now`, or
    /// when it was reserved at or before `expired_before`.
    fn lock_next_claimable(
        &self,
        queue: &str,
        now: i64,
        expired_before: i64,
    ) -> QueueResult<Option<JobRecord>>;

    /// Reads a row by id, whatever queue it is on.
    fn lock_by_id(&self, id: JobId) -> QueueResult<Option<JobRecord>>;

    /// Records a reservation. Returns the number of updated rows.
    fn mark_reserved(&self, id: JobId, attempts: u32, reserved_at: i64) -> QueueResult<usize>;

    /// Clears the reservation and makes the row due at `available_at` on
    /// `queue`. Returns the number of updated rows.
    fn mark_available(
        &self,
        id: JobId,
        queue: &str,
        attempts: u32,
        available_at: i64,
    ) -> QueueResult<usize>;

    /// Returns the number of deleted rows.
    fn delete(&self, id: JobId) -> QueueResult<usize>;
}

/// Trait for job record storage.
pub trait JobStore: Send + Sync {
    /// Runs `f` inside a transaction holding the write lock, committing if it
    /// succeeds and rolling back otherwise.
    ///
    /// This is the only way to read-then-write rows; blocks while another
    /// transaction holds the lock.
    fn with_write_lock<T>(
        &self,
        f: impl FnOnce(&dyn JobTransaction) -> QueueResult<T>,
    ) -> QueueResult<T>;

    /// Inserts a single row, returning its id.
    fn insert(&self, record: &NewJobRecord) -> QueueResult<JobId>;

    /// Inserts all rows in one transaction, returning their ids.
    fn insert_batch(&self, records: &[NewJobRecord]) -> QueueResult<Vec<JobId>>;

    /// Number of rows of `queue`, reserved ones included.
    fn count(&self, queue: &str) -> QueueResult<u64>;

    /// Reads a row without locking it.
    fn find(&self, id: JobId) -> QueueResult<Option<JobRecord>>;

    /// Names of all queues that currently hold rows.
    fn queue_names(&self) -> QueueResult<Vec<String>>;

    /// Breakdown of the rows of `queue` as seen at `now`.
    fn stats(&self, queue: &str, now: i64, expired_before: i64) -> QueueResult<QueueStats>;
}

/// SQLite-backed job store.
///
/// A store owns one connection. Clones share it; separate stores opened on
/// the same file use separate connections and coordinate through SQLite's
/// database lock, so they can live in different threads or processes.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Opens an existing job queue database or creates a new one with the
    /// current schema.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file
    /// * `busy_timeout` - How long to wait for another connection's lock before failing
    pub fn new<P: AsRef<Path>>(db_path: P, busy_timeout: Duration) -> Result<Self> {
        let db_path = db_path.as_ref();
        let is_new = !db_path.exists();

        let mut conn = Connection::open_with_flags(
            db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open job queue database at {:?}", db_path))?;

        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        migrate_to_latest(&mut conn, JOB_QUEUE_VERSIONED_SCHEMAS)
            .with_context(|| format!("Invalid job queue database at {:?}", db_path))?;

        if is_new {
            info!("Created new job queue database at {:?}", db_path);
        } else {
            info!("Opened job queue database at {:?}", db_path);
        }

        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates a store backed by a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate_to_latest(&mut conn, JOB_QUEUE_VERSIONED_SCHEMAS)?;

        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_job_record(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
        Ok(JobRecord {
            id: row.get("id")?,
            queue: row.get("queue")?,
            payload: row.get("payload")?,
            attempts: row.get("attempts")?,
            reserved_at: row.get("reserved_at")?,
            available_at: row.get("available_at")?,
            created_at: row.get("created_at")?,
        })
    }

    fn insert_with(conn: &Connection, record: &NewJobRecord) -> rusqlite::Result<JobId> {
        conn.execute(
            r#"INSERT INTO jobs (queue, payload, attempts, reserved_at, available_at, created_at)
               VALUES (?1, ?2, ?3, NULL, ?4, ?5)"#,
            params![
                record.queue,
                record.payload,
                record.attempts,
                record.available_at,
                record.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

struct SqliteJobTransaction<'c> {
    tx: rusqlite::Transaction<'c>,
}

impl JobTransaction for SqliteJobTransaction<'_> {
    fn lock_next_claimable(
        &self,
        queue: &str,
        now: i64,
        expired_before: i64,
    ) -> QueueResult<Option<JobRecord>> {
        let mut stmt = self.tx.prepare_cached(&format!(
            r#"SELECT {JOB_COLUMNS} FROM jobs
               WHERE queue = ?1
                 AND ((reserved_at IS NULL AND available_at <= ?2)
                      OR reserved_at <= ?3)
               ORDER BY attempts ASC, id ASC
               LIMIT 1"#
        ))?;
        let job = stmt
            .query_row(
                params![queue, now, expired_before],
                SqliteJobStore::row_to_job_record,
            )
            .optional()?;
        Ok(job)
    }

    fn lock_by_id(&self, id: JobId) -> QueueResult<Option<JobRecord>> {
        let mut stmt = self
            .tx
            .prepare_cached(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))?;
        let job = stmt
            .query_row(params![id], SqliteJobStore::row_to_job_record)
            .optional()?;
        Ok(job)
    }

    fn mark_reserved(&self, id: JobId, attempts: u32, reserved_at: i64) -> QueueResult<usize> {
        Ok(self.tx.execute(
            "UPDATE jobs SET attempts = ?2, reserved_at = ?3 WHERE id = ?1",
            params![id, attempts, reserved_at],
        )?)
    }

    fn mark_available(
        &self,
        id: JobId,
        queue: &str,
        attempts: u32,
        available_at: i64,
    ) -> QueueResult<usize> {
        Ok(self.tx.execute(
            r#"UPDATE jobs SET queue = ?2, attempts = ?3, reserved_at = NULL, available_at = ?4
               WHERE id = ?1"#,
            params![id, queue, attempts, available_at],
        )?)
    }

    fn delete(&self, id: JobId) -> QueueResult<usize> {
        Ok(self
            .tx
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])?)
    }
}

impl JobStore for SqliteJobStore {
    fn with_write_lock<T>(
        &self,
        f: impl FnOnce(&dyn JobTransaction) -> QueueResult<T>,
    ) -> QueueResult<T> {
        let mut conn = self.conn.lock().unwrap();
        // IMMEDIATE takes the database write lock up front, before the read,
        // so two pollers can never both see the same row as claimable.
        let locked = SqliteJobTransaction {
            tx: conn.transaction_with_behavior(TransactionBehavior::Immediate)?,
        };
        // Dropping the transaction on error rolls it back.
        let result = f(&locked)?;
        locked.tx.commit()?;
        Ok(result)
    }

    fn insert(&self, record: &NewJobRecord) -> QueueResult<JobId> {
        let conn = self.conn.lock().unwrap();
        Ok(Self::insert_with(&conn, record)?)
    }

    fn insert_batch(&self, records: &[NewJobRecord]) -> QueueResult<Vec<JobId>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ids = records
            .iter()
            .map(|record| Self::insert_with(&tx, record))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(ids)
    }

    fn count(&self, queue: &str) -> QueueResult<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE queue = ?1",
            params![queue],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn find(&self, id: JobId) -> QueueResult<Option<JobRecord>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                Self::row_to_job_record,
            )
            .optional()?;
        Ok(job)
    }

    fn queue_names(&self) -> QueueResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT queue FROM jobs ORDER BY queue")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    fn stats(&self, queue: &str, now: i64, expired_before: i64) -> QueueResult<QueueStats> {
        let conn = self.conn.lock().unwrap();
        let stats = conn.query_row(
            r#"SELECT
                 COUNT(*),
                 COALESCE(SUM(reserved_at IS NULL AND available_at <= ?2), 0),
                 COALESCE(SUM(reserved_at IS NULL AND available_at > ?2), 0),
                 COALESCE(SUM(reserved_at > ?3), 0),
                 COALESCE(SUM(reserved_at <= ?3), 0)
               FROM jobs WHERE queue = ?1"#,
            params![queue, now, expired_before],
            |row| {
                Ok(QueueStats {
                    total: row.get::<_, i64>(0)? as u64,
                    available: row.get::<_, i64>(1)? as u64,
                    delayed: row.get::<_, i64>(2)? as u64,
                    reserved: row.get::<_, i64>(3)? as u64,
                    expired: row.get::<_, i64>(4)? as u64,
                })
            },
        )?;
        Ok(stats)
    }
}
