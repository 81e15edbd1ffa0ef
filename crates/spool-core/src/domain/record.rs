//! Job record: the durable row behind one unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::RecordId;

/// Queue name used when a job does not pick one.
pub const DEFAULT_QUEUE: &str = "default";

/// Persisted status of a record.
///
/// There is no "succeeded" state: a successful job deletes its record.
///
/// State transitions:
/// - Queued -> (claim) Queued + locked
/// - locked -> Queued (retry, lock cleared) / Failed (give up) / deleted (success)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for (or currently owned by) a worker.
    Queued,

    /// Gave up. Never claimed again automatically.
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Failed => "failed",
        }
    }

    /// Is this a terminal state (no further automatic transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Values for a row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewJobRecord {
    pub queue: String,
    pub data: String,
    pub scheduled_at: DateTime<Utc>,
}

impl NewJobRecord {
    pub fn new(queue: impl Into<String>, data: impl Into<String>, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            queue: queue.into(),
            data: data.into(),
            scheduled_at,
        }
    }
}

/// Proof that a worker still owns a claimed row.
///
/// `attempts` は claim のたびに増えるので、同じ行でも claim ごとに別の lease になる。
/// reaper に lock を外されて別ワーカーが取り直した後は、古い lease はもう一致しない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease {
    pub record_id: RecordId,
    pub locked: DateTime<Utc>,
    pub attempts: u32,
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.record_id, self.locked.to_rfc3339(), self.attempts)
    }
}

/// One row of the jobs table.
///
/// Design:
/// - Store implementations own every transition; callers only read these fields.
/// - `locked` set means exactly one worker owns the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: RecordId,
    pub queue: String,

    /// Codec output (job type + arguments + state).
    pub data: String,

    pub status: JobStatus,

    /// When the current owner claimed the row. `None` means claimable.
    pub locked: Option<DateTime<Utc>>,

    /// Not claimable before this instant.
    pub scheduled_at: DateTime<Utc>,

    /// Number of claims so far (incremented at claim time).
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Materialize a freshly inserted row.
    pub fn inserted(id: RecordId, new: NewJobRecord, now: DateTime<Utc>) -> Self {
        Self {
            id,
            queue: new.queue,
            data: new.data,
            status: JobStatus::Queued,
            locked: None,
            scheduled_at: new.scheduled_at,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The one and only claimability predicate:
    /// `scheduled_at <= now AND locked IS NULL AND status = 'queued'`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.locked.is_none() && self.scheduled_at <= now
    }

    /// The lease of the current owner, if any.
    pub fn lease(&self) -> Option<Lease> {
        self.locked.map(|locked| Lease {
            record_id: self.id,
            locked,
            attempts: self.attempts,
        })
    }

    /// Still queued and locked by exactly the claim `lease` came from.
    pub fn is_held_by(&self, lease: &Lease) -> bool {
        self.status == JobStatus::Queued && self.lease().as_ref() == Some(lease)
    }

    /// Take ownership: lock and count the attempt in one step.
    pub fn claim(&mut self, now: DateTime<Utc>) {
        self.locked = Some(now);
        self.attempts += 1;
        self.updated_at = now;
    }

    /// Put back in line for a later attempt with a re-serialized payload.
    pub fn reschedule(&mut self, data: String, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.data = data;
        self.status = JobStatus::Queued;
        self.locked = None;
        self.scheduled_at = scheduled_at;
        self.updated_at = now;
    }

    /// Terminal failure.
    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.locked = None;
        self.updated_at = now;
    }

    /// Drop a lock held by a worker that went away.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.locked = None;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn record() -> JobRecord {
        JobRecord::inserted(RecordId::new(1), NewJobRecord::new("default", "{}", t0()), t0())
    }

    #[test]
    fn inserted_record_starts_queued_and_unlocked() {
        let r = record();
        assert_eq!(r.status, JobStatus::Queued);
        assert_eq!(r.locked, None);
        assert_eq!(r.attempts, 0);
        assert!(r.is_claimable(t0()));
    }

    #[test]
    fn claim_locks_and_counts() {
        let mut r = record();
        r.claim(t0());
        assert_eq!(r.locked, Some(t0()));
        assert_eq!(r.attempts, 1);
        assert!(!r.is_claimable(t0()));
    }

    #[rstest]
    #[case::future(Duration::seconds(1), false)]
    #[case::exactly_now(Duration::zero(), true)]
    #[case::past(Duration::seconds(-1), true)]
    fn claimability_respects_schedule(#[case] offset: Duration, #[case] expected: bool) {
        let mut r = record();
        r.scheduled_at = t0() + offset;
        assert_eq!(r.is_claimable(t0()), expected);
    }

    #[test]
    fn failed_records_are_never_claimable() {
        let mut r = record();
        r.claim(t0());
        r.mark_failed(t0());
        assert!(r.status.is_terminal());
        assert_eq!(r.locked, None);
        assert!(!r.is_claimable(t0() + Duration::days(1)));
    }

    #[test]
    fn reschedule_clears_lock_and_keeps_attempts() {
        let mut r = record();
        r.claim(t0());
        r.reschedule("{\"v\":2}".into(), t0() + Duration::seconds(5), t0());
        assert_eq!(r.attempts, 1);
        assert_eq!(r.locked, None);
        assert_eq!(r.data, "{\"v\":2}");
        assert!(!r.is_claimable(t0()));
        assert!(r.is_claimable(t0() + Duration::seconds(5)));
    }

    #[test]
    fn lease_does_not_survive_release_and_reclaim() {
        let mut r = record();
        assert_eq!(r.lease(), None);

        r.claim(t0());
        let first = r.lease().unwrap();
        assert!(r.is_held_by(&first));

        r.release(t0());
        assert!(!r.is_held_by(&first));

        r.claim(t0());
        let second = r.lease().unwrap();
        assert_ne!(first, second);
        assert!(!r.is_held_by(&first));
        assert!(r.is_held_by(&second));

        r.mark_failed(t0());
        assert!(!r.is_held_by(&second));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [JobStatus::Queued, JobStatus::Failed] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("succeeded".parse::<JobStatus>().is_err());
    }
}
