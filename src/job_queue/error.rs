use super::models::JobId;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors returned by queue operations.
///
/// An empty queue or an already deleted row are not errors, see
/// [`JobQueue::pop`](super::JobQueue::pop) and
/// [`JobQueue::delete_reserved`](super::JobQueue::delete_reserved).
#[derive(Debug, Error)]
pub enum QueueError {
    /// The underlying store failed, e.g. the lock wait timed out or the
    /// connection broke. The whole operation may be retried.
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The caller's reservation is no longer the row's current one, typically
    /// because the expiry window elapsed and another worker reclaimed the job.
    /// Retrying will not help, the work should be discarded.
    #[error("Reservation lost for job {id} on queue '{queue}'")]
    LostReservation { queue: String, id: JobId },

    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether the store reported lock contention rather than a hard failure.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Store(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub fn is_lost_reservation(&self) -> bool {
        matches!(self, QueueError::LostReservation { .. })
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;
