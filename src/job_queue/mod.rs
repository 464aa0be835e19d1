//! Transactional polling job queue.
//!
//! Jobs are rows of a single `jobs` table. Pollers reserve a row inside a
//! transaction holding the database write lock, so concurrent pollers never
//! hold the same reservation. A reservation older than the configured expiry
//! window is treated as abandoned and the job is handed out again, which gives
//! at-least-once delivery.

mod clock;
mod error;
mod job_handle;
mod job_store;
mod models;
mod payload;
mod queue;
mod schema;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{QueueError, QueueResult};
pub use job_handle::JobHandle;
pub use job_store::{JobStore, JobTransaction, SqliteJobStore};
pub use models::{Delay, JobId, JobRecord, NewJobRecord, Payload, QueueStats, Reservation};
pub use payload::JobPayload;
pub use queue::JobQueue;
pub use schema::JOB_QUEUE_VERSIONED_SCHEMAS;
