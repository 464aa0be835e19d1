//! The queue engine.
//!
//! Producers call [`JobQueue::push`], [`JobQueue::later`] or
//! [`JobQueue::bulk`]; consumers poll with [`JobQueue::pop`] and finish each
//! job through the returned [`JobHandle`], either deleting it once processed
//! or releasing it for another attempt.

use super::clock::Clock;
use super::error::{QueueError, QueueResult};
use super::job_handle::JobHandle;
use super::job_store::JobStore;
use super::models::{
    expired_before, Delay, JobId, JobRecord, NewJobRecord, Payload, QueueStats, Reservation,
};
use super::payload::JobPayload;
use crate::config::QueueSettings;
use crate::metrics;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub struct JobQueue<S: JobStore> {
    store: S,
    clock: Arc<dyn Clock>,
    settings: QueueSettings,
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, settings: QueueSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolves an optional queue name against the configured default.
    pub fn queue_name<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or(&self.settings.default_queue)
    }

    fn now(&self) -> i64 {
        self.clock.now().timestamp()
    }

    /// Pushes a job that is available immediately.
    pub fn push(&self, payload: Payload, queue: Option<&str>) -> QueueResult<JobId> {
        self.later(Delay::NONE, payload, queue)
    }

    /// Pushes a job that becomes available after `delay`.
    pub fn later(
        &self,
        delay: impl Into<Delay>,
        payload: Payload,
        queue: Option<&str>,
    ) -> QueueResult<JobId> {
        let queue = self.queue_name(queue);
        let delay: Delay = delay.into();
        let now = self.clock.now();
        let record = NewJobRecord {
            queue: queue.to_string(),
            payload,
            attempts: 0,
            available_at: delay.available_at(now),
            created_at: now.timestamp(),
        };

        let id = self.store.insert(&record)?;
        metrics::record_pushed(queue, 1);
        debug!(
            "Pushed job {} on queue '{}', available at {}",
            id, queue, record.available_at
        );
        Ok(id)
    }

    /// Encodes a [`JobPayload`] and pushes it.
    pub fn push_job(
        &self,
        job: &str,
        data: serde_json::Value,
        queue: Option<&str>,
    ) -> QueueResult<JobId> {
        self.later_job(Delay::NONE, job, data, queue)
    }

    pub fn later_job(
        &self,
        delay: impl Into<Delay>,
        job: &str,
        data: serde_json::Value,
        queue: Option<&str>,
    ) -> QueueResult<JobId> {
        let payload = JobPayload::new(job, data).encode()?;
        self.later(delay, payload, queue)
    }

    /// Pushes all payloads in a single transaction.
    ///
    /// All rows share one `available_at`, and either all of them become
    /// visible or none does. Returns the number of inserted rows.
    pub fn bulk(&self, payloads: Vec<Payload>, queue: Option<&str>) -> QueueResult<usize> {
        let queue = self.queue_name(queue);
        let now = self.now();
        let records: Vec<NewJobRecord> = payloads
            .into_iter()
            .map(|payload| NewJobRecord {
                queue: queue.to_string(),
                payload,
                attempts: 0,
                available_at: now,
                created_at: now,
            })
            .collect();
        if records.is_empty() {
            return Ok(0);
        }

        let ids = self.store.insert_batch(&records)?;
        metrics::record_pushed(queue, ids.len());
        debug!("Pushed {} jobs on queue '{}'", ids.len(), queue);
        Ok(ids.len())
    }

    /// Reserves the next claimable job of the queue.
    ///
    /// Returns `Ok(None)` when nothing is claimable. A job whose reservation
    /// is older than the expiry window is reclaimed and its attempts counter
    /// incremented again.
    pub fn pop(&self, queue: Option<&str>) -> QueueResult<Option<JobHandle<'_, S>>> {
        let queue = self.queue_name(queue);
        let now = self.now();
        let expired_before = expired_before(now, self.settings.expiry_secs);

        let claimed = self.store.with_write_lock(|tx| {
            let Some(job) = tx.lock_next_claimable(queue, now, expired_before)? else {
                return Ok(None);
            };

            let reclaimed = job.reserved_at.is_some();
            let attempts = job.attempts.saturating_add(1);
            if tx.mark_reserved(job.id, attempts, now)? == 0 {
                return Err(QueueError::LostReservation {
                    queue: queue.to_string(),
                    id: job.id,
                });
            }

            let reserved = JobRecord {
                attempts,
                reserved_at: Some(now),
                ..job
            };
            Ok(Some((reserved, reclaimed)))
        })?;

        let Some((record, reclaimed)) = claimed else {
            trace!("Nothing to pop on queue '{}'", queue);
            return Ok(None);
        };

        metrics::record_reserved(queue, reclaimed);
        if reclaimed {
            debug!(
                "Reclaimed expired job {} on queue '{}' (attempt {})",
                record.id, queue, record.attempts
            );
        } else {
            debug!(
                "Reserved job {} on queue '{}' (attempt {})",
                record.id, queue, record.attempts
            );
        }

        let reservation = Reservation {
            attempts: record.attempts,
            reserved_at: now,
        };
        Ok(Some(JobHandle::new(self, record, reservation)))
    }

    /// Puts a reserved job back onto `queue`, available after `delay`.
    ///
    /// With no `queue` the job goes back to the queue it was popped from. The
    /// row keeps its id and takes the attempts carried by `job`. Fails with
    /// [`QueueError::LostReservation`] if `job` does not hold the row's current
    /// reservation.
    pub fn release(
        &self,
        queue: Option<&str>,
        job: &JobRecord,
        delay: impl Into<Delay>,
    ) -> QueueResult<JobId> {
        let queue = queue.unwrap_or(job.queue.as_str());
        let delay: Delay = delay.into();
        let available_at = delay.available_at(self.clock.now());

        let result = self.store.with_write_lock(|tx| {
            let current = tx.lock_by_id(job.id)?;
            let holds_reservation = match (&current, job.reservation()) {
                (Some(current), Some(held)) => current.reservation() == Some(held),
                _ => false,
            };
            if !holds_reservation
                || tx.mark_available(job.id, queue, job.attempts, available_at)? == 0
            {
                return Err(QueueError::LostReservation {
                    queue: job.queue.clone(),
                    id: job.id,
                });
            }
            Ok(job.id)
        });

        match result {
            Ok(id) => {
                metrics::record_released(queue);
                debug!(
                    "Released job {} on queue '{}', available at {}",
                    id, queue, available_at
                );
                Ok(id)
            }
            Err(err) => Err(self.note_failure(&job.queue, err)),
        }
    }

    /// Deletes a job by id if it still exists.
    ///
    /// The row is located by id alone; `queue` only names the queue the caller
    /// expects it on. Deleting a missing row is not an error, so calling this
    /// twice is safe.
    pub fn delete_reserved(&self, queue: Option<&str>, id: JobId) -> QueueResult<()> {
        let expected_queue = self.queue_name(queue);

        let deleted = self.store.with_write_lock(|tx| {
            let Some(job) = tx.lock_by_id(id)? else {
                return Ok(None);
            };
            Ok((tx.delete(id)? > 0).then_some(job.queue))
        })?;

        match deleted {
            Some(queue) => {
                metrics::record_deleted(&queue);
                if queue != expected_queue {
                    debug!(
                        "Deleted job {} from queue '{}' (expected on '{}')",
                        id, queue, expected_queue
                    );
                } else {
                    debug!("Deleted job {} from queue '{}'", id, queue);
                }
            }
            None => trace!("Job {} already gone from queue '{}'", id, expected_queue),
        }
        Ok(())
    }

    /// Deletes a job only while `job` holds its current reservation.
    ///
    /// A row that no longer exists is a no-op, as with
    /// [`delete_reserved`](Self::delete_reserved). A row that has been reserved
    /// again since fails with [`QueueError::LostReservation`] and is left alone.
    pub fn delete_reservation(&self, job: &JobRecord) -> QueueResult<()> {
        let queue = job.queue.as_str();

        let result = self.store.with_write_lock(|tx| {
            let Some(current) = tx.lock_by_id(job.id)? else {
                return Ok(false);
            };
            if job.reservation().is_none() || current.reservation() != job.reservation() {
                return Err(QueueError::LostReservation {
                    queue: queue.to_string(),
                    id: job.id,
                });
            }
            Ok(tx.delete(job.id)? > 0)
        });

        match result {
            Ok(true) => {
                metrics::record_deleted(queue);
                debug!("Deleted job {} from queue '{}'", job.id, queue);
                Ok(())
            }
            Ok(false) => {
                trace!("Job {} already gone from queue '{}'", job.id, queue);
                Ok(())
            }
            Err(err) => Err(self.note_failure(queue, err)),
        }
    }

    /// Number of jobs in the queue, reserved ones included.
    pub fn size(&self, queue: Option<&str>) -> QueueResult<u64> {
        self.store.count(self.queue_name(queue))
    }

    pub fn find(&self, id: JobId) -> QueueResult<Option<JobRecord>> {
        self.store.find(id)
    }

    pub fn stats(&self, queue: Option<&str>) -> QueueResult<QueueStats> {
        let now = self.now();
        self.store.stats(
            self.queue_name(queue),
            now,
            expired_before(now, self.settings.expiry_secs),
        )
    }

    pub fn queue_names(&self) -> QueueResult<Vec<String>> {
        self.store.queue_names()
    }

    fn note_failure(&self, queue: &str, err: QueueError) -> QueueError {
        if let QueueError::LostReservation { id, .. } = &err {
            metrics::record_lost_reservation(queue);
            warn!(
                "Job {} on queue '{}' is no longer reserved by this worker",
                id, queue
            );
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_queue::clock::ManualClock;
    use crate::job_queue::job_store::SqliteJobStore;
    use serde_json::json;
    use std::time::Duration;

    const START: i64 = 1_700_000_000;

    fn setup() -> (JobQueue<SqliteJobStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_timestamp(START));
        let queue = JobQueue::new(
            SqliteJobStore::in_memory().unwrap(),
            clock.clone(),
            QueueSettings::default(),
        );
        (queue, clock)
    }

    fn insert_with_attempts(queue: &JobQueue<SqliteJobStore>, payload: &[u8], attempts: u32) {
        queue
            .store()
            .insert(&NewJobRecord {
                queue: "default".to_string(),
                payload: payload.to_vec(),
                attempts,
                available_at: START,
                created_at: START,
            })
            .unwrap();
    }

    fn pop_payload(queue: &JobQueue<SqliteJobStore>) -> Option<Vec<u8>> {
        queue
            .pop(None)
            .unwrap()
            .map(|job| job.payload().to_vec())
    }

    #[test]
    fn test_push_creates_available_row() {
        let (queue, _clock) = setup();
        let id = queue.push(b"payload".to_vec(), None).unwrap();

        let job = queue.find(id).unwrap().unwrap();
        assert_eq!(job.queue, "default");
        assert_eq!(job.attempts, 0);
        assert_eq!(job.reserved_at, None);
        assert_eq!(job.available_at, START);
        assert_eq!(job.created_at, START);
        assert_eq!(queue.size(None).unwrap(), 1);
    }

    #[test]
    fn test_named_queues_are_isolated() {
        let (queue, _clock) = setup();
        queue.push(b"email".to_vec(), Some("emails")).unwrap();

        assert_eq!(queue.size(None).unwrap(), 0);
        assert_eq!(queue.size(Some("emails")).unwrap(), 1);
        assert!(queue.pop(None).unwrap().is_none());

        let job = queue.pop(Some("emails")).unwrap().unwrap();
        assert_eq!(job.queue_name(), "emails");
    }

    #[test]
    fn test_default_queue_comes_from_settings() {
        let clock = Arc::new(ManualClock::at_timestamp(START));
        let queue = JobQueue::new(
            SqliteJobStore::in_memory().unwrap(),
            clock,
            QueueSettings {
                default_queue: "background".to_string(),
                ..Default::default()
            },
        );

        queue.push(b"x".to_vec(), None).unwrap();
        assert_eq!(queue.size(Some("background")).unwrap(), 1);
        assert_eq!(queue.size(Some("default")).unwrap(), 0);
    }

    #[test]
    fn test_pop_returns_rows_in_id_order() {
        let (queue, _clock) = setup();
        queue.push(b"1".to_vec(), None).unwrap();
        queue.push(b"2".to_vec(), None).unwrap();
        queue.push(b"3".to_vec(), None).unwrap();

        assert_eq!(pop_payload(&queue), Some(b"1".to_vec()));
        assert_eq!(pop_payload(&queue), Some(b"2".to_vec()));
        assert_eq!(pop_payload(&queue), Some(b"3".to_vec()));
        assert_eq!(pop_payload(&queue), None);
    }

    #[test]
    fn test_pop_prefers_fewer_attempts() {
        let (queue, _clock) = setup();
        insert_with_attempts(&queue, b"1", 0);
        insert_with_attempts(&queue, b"2", 1);
        insert_with_attempts(&queue, b"3", 0);

        assert_eq!(pop_payload(&queue), Some(b"1".to_vec()));
        assert_eq!(pop_payload(&queue), Some(b"3".to_vec()));
        assert_eq!(pop_payload(&queue), Some(b"2".to_vec()));
    }

    #[test]
    fn test_pop_reserves_and_increments_attempts() {
        let (queue, _clock) = setup();
        let id = queue.push(b"p".to_vec(), None).unwrap();

        let job = queue.pop(None).unwrap().unwrap();
        assert_eq!(job.id(), id);
        assert_eq!(job.attempts(), 1);
        assert_eq!(job.reserved_at(), START);

        let row = queue.find(id).unwrap().unwrap();
        assert_eq!(row.attempts, 1);
        assert_eq!(row.reserved_at, Some(START));

        // Reserved rows stay counted but are not handed out again
        assert_eq!(queue.size(None).unwrap(), 1);
        assert!(queue.pop(None).unwrap().is_none());
    }

    #[test]
    fn test_later_is_invisible_until_due() {
        let (queue, clock) = setup();
        queue
            .later(Duration::from_secs(100), b"P".to_vec(), None)
            .unwrap();

        assert!(queue.pop(None).unwrap().is_none());

        clock.advance_secs(99);
        assert!(queue.pop(None).unwrap().is_none());

        clock.advance_secs(1);
        let job = queue.pop(None).unwrap().unwrap();
        assert_eq!(job.payload(), b"P");
    }

    #[test]
    fn test_later_accepts_absolute_time() {
        let (queue, clock) = setup();
        let at = clock.now() + chrono::Duration::seconds(30);
        let id = queue.later(at, b"P".to_vec(), None).unwrap();

        assert_eq!(queue.find(id).unwrap().unwrap().available_at, START + 30);
    }

    #[test]
    fn test_expired_reservation_is_reclaimed() {
        let (queue, clock) = setup();
        let id = queue.push(b"p".to_vec(), None).unwrap();

        let first = queue.pop(None).unwrap().unwrap();
        assert_eq!(first.attempts(), 1);

        clock.advance_secs(59);
        assert!(queue.pop(None).unwrap().is_none());

        clock.advance_secs(1);
        let second = queue.pop(None).unwrap().unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.attempts(), 2);
        assert_eq!(second.reserved_at(), START + 60);
    }

    #[test]
    fn test_release_preserves_attempts() {
        let (queue, clock) = setup();
        insert_with_attempts(&queue, b"retry", 2);

        let job = queue.pop(None).unwrap().unwrap();
        assert_eq!(job.attempts(), 3);
        let id = job.release(Duration::from_secs(10)).unwrap();

        let row = queue.find(id).unwrap().unwrap();
        assert_eq!(row.attempts, 3);
        assert_eq!(row.reserved_at, None);
        assert_eq!(row.available_at, START + 10);

        assert!(queue.pop(None).unwrap().is_none());
        clock.advance_secs(10);
        let job = queue.pop(None).unwrap().unwrap();
        assert_eq!(job.id(), id);
        assert_eq!(job.attempts(), 4);
    }

    #[test]
    fn test_delete_reserved_is_idempotent() {
        let (queue, _clock) = setup();
        let id = queue.push(b"p".to_vec(), None).unwrap();
        let job = queue.pop(None).unwrap().unwrap();
        assert_eq!(job.id(), id);

        queue.delete_reserved(None, id).unwrap();
        queue.delete_reserved(None, id).unwrap();
        assert_eq!(queue.size(None).unwrap(), 0);
        assert!(queue.find(id).unwrap().is_none());
    }

    #[test]
    fn test_delete_reserved_finds_job_by_id_alone() {
        let (queue, clock) = setup();
        let id = queue.push(b"p".to_vec(), Some("emails")).unwrap();
        let job = queue.pop(Some("emails")).unwrap().unwrap();
        assert_eq!(job.id(), id);

        // Acknowledged through the default queue name
        queue.delete_reserved(None, id).unwrap();
        assert!(queue.find(id).unwrap().is_none());
        assert_eq!(queue.size(Some("emails")).unwrap(), 0);

        clock.advance_secs(60);
        assert!(queue.pop(Some("emails")).unwrap().is_none());
    }

    #[test]
    fn test_release_into_another_queue() {
        let (queue, _clock) = setup();
        let id = queue.push(b"p".to_vec(), Some("emails")).unwrap();
        let job = queue.pop(Some("emails")).unwrap().unwrap();
        let record = job.record().clone();

        let released = queue
            .release(Some("emails-retry"), &record, Delay::NONE)
            .unwrap();
        assert_eq!(released, id);
        assert_eq!(queue.size(Some("emails")).unwrap(), 0);

        let job = queue.pop(Some("emails-retry")).unwrap().unwrap();
        assert_eq!(job.id(), id);
        assert_eq!(job.queue_name(), "emails-retry");
        assert_eq!(job.attempts(), 2);
    }

    #[test]
    fn test_release_without_queue_keeps_jobs_own_queue() {
        let (queue, _clock) = setup();
        queue.push(b"p".to_vec(), Some("emails")).unwrap();
        let job = queue.pop(Some("emails")).unwrap().unwrap();
        let record = job.record().clone();

        queue.release(None, &record, Delay::NONE).unwrap();
        assert_eq!(queue.size(Some("emails")).unwrap(), 1);
        assert_eq!(queue.size(None).unwrap(), 0);
    }

    #[test]
    fn test_handle_delete_removes_row() {
        let (queue, _clock) = setup();
        queue.push(b"p".to_vec(), None).unwrap();

        let job = queue.pop(None).unwrap().unwrap();
        job.delete().unwrap();
        assert_eq!(queue.size(None).unwrap(), 0);
    }

    #[test]
    fn test_stale_handle_loses_reservation() {
        let (queue, clock) = setup();
        let id = queue.push(b"p".to_vec(), None).unwrap();

        let stale = queue.pop(None).unwrap().unwrap();
        clock.advance_secs(60);
        let current = queue.pop(None).unwrap().unwrap();
        assert_eq!(current.id(), id);

        let stale_record = stale.record().clone();
        let err = stale.release(Delay::NONE).unwrap_err();
        assert!(err.is_lost_reservation());
        let err = queue.delete_reservation(&stale_record).unwrap_err();
        assert!(err.is_lost_reservation());

        // The live reservation is untouched
        let row = queue.find(id).unwrap().unwrap();
        assert_eq!(row.attempts, 2);
        assert_eq!(row.reserved_at, Some(START + 60));

        current.delete().unwrap();
        assert_eq!(queue.size(None).unwrap(), 0);
    }

    #[test]
    fn test_release_of_deleted_job_loses_reservation() {
        let (queue, _clock) = setup();
        let id = queue.push(b"p".to_vec(), None).unwrap();
        let job = queue.pop(None).unwrap().unwrap();

        queue.delete_reserved(None, id).unwrap();
        let err = job.release(Delay::NONE).unwrap_err();
        assert!(matches!(err, QueueError::LostReservation { id: lost, .. } if lost == id));
    }

    #[test]
    fn test_handle_delete_after_row_gone_is_noop() {
        let (queue, _clock) = setup();
        let id = queue.push(b"p".to_vec(), None).unwrap();
        let job = queue.pop(None).unwrap().unwrap();

        queue.delete_reserved(None, id).unwrap();
        job.delete().unwrap();
    }

    #[test]
    fn test_release_requires_a_reservation() {
        let (queue, _clock) = setup();
        let id = queue.push(b"p".to_vec(), None).unwrap();
        let unreserved = queue.find(id).unwrap().unwrap();

        let err = queue.release(None, &unreserved, Delay::NONE).unwrap_err();
        assert!(err.is_lost_reservation());
    }

    #[test]
    fn test_bulk_inserts_all_rows() {
        let (queue, _clock) = setup();
        queue.push(b"existing".to_vec(), None).unwrap();

        let inserted = queue
            .bulk(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()], None)
            .unwrap();
        assert_eq!(inserted, 3);
        assert_eq!(queue.size(None).unwrap(), 4);

        assert_eq!(pop_payload(&queue), Some(b"existing".to_vec()));
        assert_eq!(pop_payload(&queue), Some(b"a".to_vec()));
        assert_eq!(pop_payload(&queue), Some(b"b".to_vec()));
        assert_eq!(pop_payload(&queue), Some(b"c".to_vec()));
    }

    #[test]
    fn test_bulk_with_no_payloads() {
        let (queue, _clock) = setup();
        assert_eq!(queue.bulk(Vec::new(), None).unwrap(), 0);
        assert_eq!(queue.size(None).unwrap(), 0);
    }

    #[test]
    fn test_push_job_encodes_payload() {
        let (queue, _clock) = setup();
        queue
            .push_job("send_email", json!({"to": "someone@example.com"}), None)
            .unwrap();

        let job = queue.pop(None).unwrap().unwrap();
        let payload = job.decode_payload().unwrap();
        assert_eq!(payload.job, "send_email");
        assert_eq!(payload.data["to"], "someone@example.com");
    }

    #[test]
    fn test_stats_follow_clock() {
        let (queue, clock) = setup();
        queue.push(b"a".to_vec(), None).unwrap();
        queue.push(b"b".to_vec(), None).unwrap();
        queue.later(Delay::seconds(300), b"c".to_vec(), None).unwrap();
        let _job = queue.pop(None).unwrap().unwrap();

        let stats = queue.stats(None).unwrap();
        assert_eq!(
            stats,
            QueueStats {
                total: 3,
                available: 1,
                delayed: 1,
                reserved: 1,
                expired: 0,
            }
        );

        clock.advance_secs(60);
        let stats = queue.stats(None).unwrap();
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.expired, 1);
    }

    #[test]
    fn test_queue_names() {
        let (queue, _clock) = setup();
        queue.push(b"a".to_vec(), Some("emails")).unwrap();
        queue.push(b"b".to_vec(), None).unwrap();

        assert_eq!(queue.queue_names().unwrap(), vec!["default", "emails"]);
    }
}
