//! Job queue data models.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Row identifier, assigned by the store in insertion order.
pub type JobId = i64;

/// Opaque serialized job description.
pub type Payload = Vec<u8>;

/// A row of the jobs table.
///
/// Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub payload: Payload,
    /// Number of times the row has been reserved.
    pub attempts: u32,
    /// When the current reservation was taken, `None` while the row is available.
    pub reserved_at: Option<i64>,
    /// The row must not be reserved before this time.
    pub available_at: i64,
    pub created_at: i64,
}

impl JobRecord {
    /// Whether a poller running at `now` may reserve this row.
    ///
    /// Mirrors the predicate the store evaluates in SQL: either available and
    /// due, or reserved long enough ago that the reservation is considered
    /// abandoned.
    pub fn is_claimable(&self, now: i64, expiry_secs: u64) -> bool {
        match self.reserved_at {
            None => self.available_at <= now,
            Some(reserved_at) => reserved_at <= expired_before(now, expiry_secs),
        }
    }

    /// The reservation currently recorded on the row, if any.
    pub fn reservation(&self) -> Option<Reservation> {
        self.reserved_at.map(|reserved_at| Reservation {
            attempts: self.attempts,
            reserved_at,
        })
    }
}

/// Identifies one reservation epoch of a row.
///
/// Every reservation bumps `attempts`, so the pair is unique per epoch even
/// when two reservations land in the same second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub attempts: u32,
    pub reserved_at: i64,
}

/// A row to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJobRecord {
    pub queue: String,
    pub payload: Payload,
    pub attempts: u32,
    pub available_at: i64,
    pub created_at: i64,
}

/// When a pushed or released job becomes available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Relative to the time of the operation.
    After(Duration),
    /// Absolute point in time.
    At(DateTime<Utc>),
}

impl Delay {
    pub const NONE: Delay = Delay::After(Duration::ZERO);

    pub fn seconds(secs: u64) -> Self {
        Delay::After(Duration::from_secs(secs))
    }

    /// Resolves the delay into an `available_at` unix timestamp.
    pub fn available_at(&self, now: DateTime<Utc>) -> i64 {
        match self {
            Delay::After(duration) => {
                let secs = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
                now.timestamp().saturating_add(secs)
            }
            Delay::At(at) => at.timestamp(),
        }
    }
}

impl Default for Delay {
    fn default() -> Self {
        Delay::NONE
    }
}

impl From<Duration> for Delay {
    fn from(duration: Duration) -> Self {
        Delay::After(duration)
    }
}

impl From<DateTime<Utc>> for Delay {
    fn from(at: DateTime<Utc>) -> Self {
        Delay::At(at)
    }
}

/// Point-in-time breakdown of a queue, for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: u64,
    /// Not reserved and due.
    pub available: u64,
    /// Not reserved and not yet due.
    pub delayed: u64,
    /// Reserved within the expiry window.
    pub reserved: u64,
    /// Reserved longer ago than the expiry window, reclaimable by the next pop.
    pub expired: u64,
}

/// Reservations taken at or before the returned timestamp are abandoned.
pub(crate) fn expired_before(now: i64, expiry_secs: u64) -> i64 {
    now.saturating_sub(i64::try_from(expiry_secs).unwrap_or(i64::MAX))
}
