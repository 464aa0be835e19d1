//! Pezzottify Job Queue Library
//!
//! A polling job queue stored in SQLite, with reservation expiry and
//! attempt counting.

pub mod config;
pub mod job_queue;
pub mod metrics;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use config::QueueSettings;
pub use job_queue::{
    Clock, Delay, JobHandle, JobId, JobPayload, JobQueue, JobStore, QueueError, QueueResult,
    SqliteJobStore, SystemClock,
};
