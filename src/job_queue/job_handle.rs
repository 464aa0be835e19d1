use super::error::QueueResult;
use super::job_store::JobStore;
use super::models::{Delay, JobId, JobRecord, Reservation};
use super::payload::JobPayload;
use super::queue::JobQueue;
use std::fmt;

/// A job reserved by [`JobQueue::pop`].
///
/// Holds the row as it was at reservation time; it is never refreshed. Finish
/// it with [`delete`](Self::delete) once processed, or
/// [`release`](Self::release) it to be retried. Dropping a handle does
/// neither, and the job is reclaimed once its reservation expires.
pub struct JobHandle<'q, S: JobStore> {
    queue: &'q JobQueue<S>,
    record: JobRecord,
    reservation: Reservation,
}

impl<'q, S: JobStore> JobHandle<'q, S> {
    pub(crate) fn new(queue: &'q JobQueue<S>, record: JobRecord, reservation: Reservation) -> Self {
        Self {
            queue,
            record,
            reservation,
        }
    }

    pub fn id(&self) -> JobId {
        self.record.id
    }

    pub fn queue_name(&self) -> &str {
        &self.record.queue
    }

    pub fn payload(&self) -> &[u8] {
        &self.record.payload
    }

    /// Attempts including this one.
    pub fn attempts(&self) -> u32 {
        self.reservation.attempts
    }

    pub fn reserved_at(&self) -> i64 {
        self.reservation.reserved_at
    }

    pub fn reservation(&self) -> Reservation {
        self.reservation
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn decode_payload(&self) -> QueueResult<JobPayload> {
        JobPayload::decode(&self.record.payload)
    }

    /// Puts the job back on its queue with the current attempts count.
    pub fn release(self, delay: impl Into<Delay>) -> QueueResult<JobId> {
        self.queue.release(None, &self.record, delay)
    }

    /// Removes the job, unless another worker has reserved it since.
    pub fn delete(self) -> QueueResult<()> {
        self.queue.delete_reservation(&self.record)
    }
}

impl<S: JobStore> fmt::Debug for JobHandle<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.record.id)
            .field("queue", &self.record.queue)
            .field("attempts", &self.reservation.attempts)
            .field("reserved_at", &self.reservation.reserved_at)
            .field("payload_len", &self.record.payload.len())
            .finish()
    }
}
