//! Queue: the handle producers and workers talk to.
//!
//! A `Queue` binds one `JobStore` to the job registry, a clock and a retry
//! policy. It turns runtimes into rows (encode + insert) and claimed rows back
//! into runtimes (claim + decode). Every row mutation is delegated to the store.

mod connections;
mod retry;

pub use connections::{ConnectionError, QueueConnections};
pub use retry::RetryPolicy;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, instrument, warn};

use crate::domain::{JobRecord, Lease, NewJobRecord, RecordId, WaitExpr};
use crate::error::JobError;
use crate::observability::QueueCounts;
use crate::ports::{Clock, JobStore, RetryDecision, StoreError, SystemClock};
use crate::typed::{CodecError, DynJob, Job, JobRegistry, JobRuntime, PayloadCodec, RetryOptions};

/// Result of a successful claim.
///
/// Design intent:
/// - The row is already locked and its attempt counted when this is returned.
/// - An undecodable row is handed back as is, with its lease, so the worker can
///   fail it without running anything.
pub enum Claim {
    Job(Box<dyn DynJob>),
    Undecodable {
        record: JobRecord,
        lease: Lease,
        error: CodecError,
    },
}

impl Claim {
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            Claim::Job(job) => job.backend_id(),
            Claim::Undecodable { record, .. } => Some(record.id),
        }
    }

    pub fn into_job(self) -> Option<Box<dyn DynJob>> {
        match self {
            Claim::Job(job) => Some(job),
            Claim::Undecodable { .. } => None,
        }
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Claim::Job(job) => f
                .debug_struct("Job")
                .field("job_type", &job.job_type())
                .field("uid", &job.uid())
                .field("backend_id", &job.backend_id())
                .field("attempts", &job.attempts())
                .finish(),
            Claim::Undecodable { record, lease, error } => f
                .debug_struct("Undecodable")
                .field("record_id", &record.id)
                .field("lease", lease)
                .field("error", error)
                .finish(),
        }
    }
}

/// One named connection to a job store.
///
/// Cheap to clone; clones share the store, registry and clock.
#[derive(Clone)]
pub struct Queue {
    name: String,
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
}

impl Queue {
    pub fn new(name: impl Into<String>, store: Arc<dyn JobStore>, registry: Arc<JobRegistry>) -> Self {
        Self {
            name: name.into(),
            store,
            registry,
            clock: Arc::new(SystemClock),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// The clock used for `run_at` / retry times. Should be the store's clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Connection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// `now + wait` on this queue's clock.
    pub fn due_after(&self, wait: WaitExpr) -> Result<DateTime<Utc>, JobError> {
        let from = self.now();
        wait.after(from).ok_or(JobError::Schedule { wait, from })
    }

    /// Insert `job` as a queued row due at `run_at`.
    #[instrument(skip_all, fields(connection = %self.name, job_type = J::TYPE, queue = job.queue()))]
    pub async fn add<J: Job>(&self, job: &mut JobRuntime<J>, run_at: DateTime<Utc>) -> Result<RecordId, JobError> {
        let now = self.now();
        job.set_enqueued_at(now);
        let data = PayloadCodec::encode(job)?;

        let record_id = self
            .store
            .insert(NewJobRecord::new(job.queue(), data, run_at))
            .await?;
        job.mark_enqueued(record_id, now);

        debug!(%record_id, %run_at, "job enqueued");
        Ok(record_id)
    }

    /// Claim the oldest due row of `queue` and decode it.
    pub async fn claim_next(&self, queue: &str) -> Result<Option<Claim>, StoreError> {
        let Some(record) = self.store.claim_next(queue).await? else {
            return Ok(None);
        };
        let Some(lease) = record.lease() else {
            return Err(StoreError::CorruptRow(format!(
                "record {} came back from a claim without a lock",
                record.id
            )));
        };

        let claim = match self.registry.decode(&record.data) {
            Ok(mut job) => {
                // 行の attempts が正（payload 側は前回 encode 時点の値）
                job.attach_lease(lease);
                Claim::Job(job)
            }
            Err(error) => {
                warn!(record_id = %record.id, error = %error, "claimed row could not be decoded");
                Claim::Undecodable { record, lease, error }
            }
        };
        Ok(Some(claim))
    }

    /// Forget the job's row. Idempotent: `Ok(false)` when there was nothing
    /// (left) to delete, including a job that was never enqueued.
    pub async fn succeed<J: Job>(&self, job: &JobRuntime<J>) -> Result<bool, JobError> {
        let Some(lease) = held_lease(job)? else {
            return Ok(false);
        };
        let deleted = self.store.complete(&lease).await?;
        if !deleted {
            debug!(%lease, "succeed on a row that is gone or no longer ours");
        }
        Ok(deleted)
    }

    /// Terminal failure: `status = failed`, unlocked.
    ///
    /// `Ok(false)` when the job holds no claim on a row or the claim was lost.
    pub async fn fail<J: Job>(&self, job: &JobRuntime<J>) -> Result<bool, JobError> {
        match held_lease(job)? {
            Some(lease) => Ok(self.fail_claim(&lease).await?),
            None => Ok(false),
        }
    }

    /// Reschedule (re-serializing the job) or fail once the budget is spent.
    ///
    /// Unset options fall back to the retry policy: `limit` to `max_attempts`,
    /// `wait` to the backoff delay for the current attempt count.
    pub async fn retry<J: Job>(&self, job: &JobRuntime<J>, options: &RetryOptions) -> Result<RetryDecision, JobError> {
        let Some(lease) = held_lease(job)? else {
            return Ok(RetryDecision::Failed {
                attempts: job.attempts(),
            });
        };

        let limit = options.limit.unwrap_or(self.retry_policy.max_attempts);
        let wait = options
            .wait
            .unwrap_or_else(|| self.retry_policy.next_wait(job.attempts()));
        let scheduled_at = self.due_after(wait)?;
        let data = PayloadCodec::encode(job)?;

        let record_id = lease.record_id;
        let decision = self.store.retry(&lease, &data, scheduled_at, limit).await?;
        match decision {
            RetryDecision::Rescheduled { scheduled_at } => {
                debug!(%record_id, %scheduled_at, limit, "job rescheduled");
            }
            RetryDecision::Failed { attempts } => {
                warn!(%record_id, attempts, limit, "retry budget exhausted; job failed");
            }
            RetryDecision::NotOwned => {
                warn!(%lease, "retry dropped; the claim on this row was lost");
            }
        }
        Ok(decision)
    }

    /// Fail the row behind a claim. `false` when the lease no longer owns it.
    pub async fn fail_claim(&self, lease: &Lease) -> Result<bool, StoreError> {
        self.store.fail_claimed(lease).await
    }

    /// Operator override: force a row to `failed` whoever holds it.
    /// A failed row is never claimed again (until replayed).
    pub async fn fail_record(&self, record_id: RecordId) -> Result<(), StoreError> {
        self.store.mark_failed(record_id).await
    }

    pub async fn get(&self, record_id: RecordId) -> Result<Option<JobRecord>, StoreError> {
        self.store.get(record_id).await
    }

    /// Delete failed rows of `queue` (all queues when `None`).
    pub async fn purge(&self, queue: Option<&str>) -> Result<u64, StoreError> {
        self.store.purge(queue).await
    }

    pub async fn replay(&self, record_id: RecordId) -> Result<RecordId, StoreError> {
        self.store.replay(record_id).await
    }

    pub async fn release_expired(&self, lock_timeout: Duration) -> Result<u64, StoreError> {
        self.store.release_expired(lock_timeout).await
    }

    pub async fn counts(&self, queue: &str) -> Result<QueueCounts, StoreError> {
        self.store.counts(queue).await
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("registry", &self.registry)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

/// The lease a job must hold before it may report to the store.
///
/// A job that was never enqueued has none. An enqueued job that was not claimed
/// in this process (or was re-decoded from its payload) is `Detached`.
fn held_lease<J: Job>(job: &JobRuntime<J>) -> Result<Option<Lease>, JobError> {
    match (job.backend_id(), job.lease()) {
        (None, _) => Ok(None),
        (Some(_), Some(lease)) => Ok(Some(lease)),
        (Some(record_id), None) => Err(JobError::Detached {
            uid: job.uid(),
            record_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionError, JobStatus, WaitExpr};
    use crate::impls::MemoryJobStore;
    use crate::ports::FixedClock;
    use crate::typed::JobContext;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Noop;

    #[async_trait]
    impl Job for Noop {
        const TYPE: &'static str = "test.noop.v1";
        type Args = u32;

        async fn execute(&mut self, _ctx: &JobContext, _args: &u32) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (Queue, MemoryJobStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(t0()));
        let store = MemoryJobStore::with_clock(clock.clone());
        let mut registry = JobRegistry::new();
        registry.register::<Noop>().unwrap();
        let queue = Queue::new("main", Arc::new(store.clone()), Arc::new(registry))
            .with_clock(clock.clone())
            .with_retry_policy(RetryPolicy::default().with_max_attempts(3));
        (queue, store, clock)
    }

    #[tokio::test]
    async fn add_inserts_queued_row() {
        let (queue, store, _) = setup();
        let mut job = JobRuntime::new(Noop, 1).on_queue("mail");
        let id = queue.add(&mut job, t0()).await.unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.queue, "mail");
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.attempts, 0);
        assert_eq!(row.locked, None);
        assert_eq!(job.backend_id(), Some(id));
    }

    #[tokio::test]
    async fn claim_attaches_record_and_attempts() {
        let (queue, _, _) = setup();
        let mut job = JobRuntime::new(Noop, 1);
        let id = queue.add(&mut job, t0()).await.unwrap();

        let claimed = queue.claim_next("default").await.unwrap().unwrap();
        assert_eq!(claimed.record_id(), Some(id));
        let claimed = claimed.into_job().unwrap();
        assert_eq!(claimed.attempts(), 1);
        assert_eq!(claimed.uid(), job.uid());
    }

    #[tokio::test]
    async fn unregistered_payload_is_undecodable() {
        let (queue, store, _) = setup();
        let id = store
            .insert(NewJobRecord::new("default", r#"{"type":"gone.v1"}"#, t0()))
            .await
            .unwrap();

        match queue.claim_next("default").await.unwrap().unwrap() {
            Claim::Undecodable { record, .. } => assert_eq!(record.id, id),
            other => panic!("unexpected claim: {other:?}"),
        }
    }

    #[tokio::test]
    async fn succeed_twice_is_fine() {
        let (queue, store, _) = setup();
        let mut job = JobRuntime::new(Noop, 1);
        let id = queue.add(&mut job, t0()).await.unwrap();
        let record = store.claim_next("default").await.unwrap().unwrap();
        let claimed = PayloadCodec::decode_claimed::<Noop>(&record).unwrap();

        assert!(queue.succeed(&claimed).await.unwrap());
        assert!(!queue.succeed(&claimed).await.unwrap());
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reporting_without_a_claim_is_detached() {
        let (queue, store, _) = setup();
        let mut job = JobRuntime::new(Noop, 1);
        let id = queue.add(&mut job, t0()).await.unwrap();

        assert!(matches!(queue.succeed(&job).await, Err(JobError::Detached { record_id, .. }) if record_id == id));
        assert!(matches!(queue.fail(&job).await, Err(JobError::Detached { .. })));
        assert!(matches!(
            queue.retry(&job, &RetryOptions::new()).await,
            Err(JobError::Detached { .. })
        ));
        assert_eq!(store.get(id).await.unwrap().unwrap().locked, None);
    }

    #[tokio::test]
    async fn retry_without_options_uses_policy() {
        let (queue, store, _) = setup();
        let mut job = JobRuntime::new(Noop, 1);
        let id = queue.add(&mut job, t0()).await.unwrap();
        let record = store.claim_next("default").await.unwrap().unwrap();
        let claimed = PayloadCodec::decode_claimed::<Noop>(&record).unwrap();

        let decision = queue.retry(&claimed, &RetryOptions::new()).await.unwrap();
        // attempts=1 → base_delay (2s)
        assert_eq!(
            decision,
            RetryDecision::Rescheduled {
                scheduled_at: t0() + Duration::seconds(2)
            }
        );
        assert_eq!(store.get(id).await.unwrap().unwrap().locked, None);
    }

    #[tokio::test]
    async fn retry_with_explicit_wait() {
        let (queue, store, _) = setup();
        let mut job = JobRuntime::new(Noop, 1);
        queue.add(&mut job, t0()).await.unwrap();
        let record = store.claim_next("default").await.unwrap().unwrap();
        let claimed = PayloadCodec::decode_claimed::<Noop>(&record).unwrap();

        let decision = queue
            .retry(&claimed, &RetryOptions::new().wait(WaitExpr::seconds(5)))
            .await
            .unwrap();
        assert_eq!(
            decision,
            RetryDecision::Rescheduled {
                scheduled_at: t0() + Duration::seconds(5)
            }
        );
    }

    #[tokio::test]
    async fn operator_failure_wins_over_a_late_retry() {
        let (queue, store, _) = setup();
        let mut job = JobRuntime::new(Noop, 1);
        let id = queue.add(&mut job, t0()).await.unwrap();
        let record = store.claim_next("default").await.unwrap().unwrap();
        let claimed = PayloadCodec::decode_claimed::<Noop>(&record).unwrap();

        queue.fail_record(id).await.unwrap();

        let decision = queue.retry(&claimed, &RetryOptions::new()).await.unwrap();
        assert_eq!(decision, RetryDecision::NotOwned);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Failed);
        assert!(queue.claim_next("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_after_rejects_overflowing_schedules() {
        let (queue, _, clock) = setup();
        assert_eq!(queue.due_after(WaitExpr::seconds(5)).unwrap(), t0() + Duration::seconds(5));

        clock.set(Utc.with_ymd_and_hms(262_100, 1, 1, 0, 0, 0).unwrap());
        assert!(matches!(
            queue.due_after(WaitExpr::MAX),
            Err(JobError::Schedule { wait, .. }) if wait == WaitExpr::MAX
        ));
    }
}
