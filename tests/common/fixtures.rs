use pezzottify_job_queue::config::QueueSettings;
use pezzottify_job_queue::job_queue::{JobQueue, ManualClock, SqliteJobStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const START_TIMESTAMP: i64 = 1_700_000_000;

/// Generous so that contended tests never time out waiting for the lock.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// A database file in a temporary directory, plus the clock shared by every
/// queue opened on it.
pub struct TestDb {
    _dir: TempDir,
    pub path: PathBuf,
    pub clock: Arc<ManualClock>,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("jobs.db");
        Self {
            _dir: dir,
            path,
            clock: Arc::new(ManualClock::at_timestamp(START_TIMESTAMP)),
        }
    }

    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            busy_timeout_ms: BUSY_TIMEOUT.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn open_store(&self) -> SqliteJobStore {
        SqliteJobStore::new(&self.path, BUSY_TIMEOUT).expect("Failed to open job store")
    }

    /// Opens a queue on a new connection to the database.
    pub fn open_queue(&self) -> JobQueue<SqliteJobStore> {
        JobQueue::new(self.open_store(), self.clock.clone(), self.settings())
    }

    /// Opens a queue whose connection gives up quickly on a held lock.
    pub fn open_impatient_queue(&self, busy_timeout: Duration) -> JobQueue<SqliteJobStore> {
        let store =
            SqliteJobStore::new(&self.path, busy_timeout).expect("Failed to open job store");
        let settings = QueueSettings {
            busy_timeout_ms: busy_timeout.as_millis() as u64,
            ..Default::default()
        };
        JobQueue::new(store, self.clock.clone(), settings)
    }
}
