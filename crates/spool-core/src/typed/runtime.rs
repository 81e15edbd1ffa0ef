//! JobRuntime - ジョブ 1 件の実体とライフサイクル
//!
//! # 状態遷移
//! `CREATED → (dispatch) QUEUED → (claim) RUNNING → { SUCCEEDED | RETRY_SCHEDULED | FAILED }`
//!
//! # 二層構造
//! - **表層（Typed）**: `JobRuntime<J>` - 引数もジョブの状態も型のまま持つ
//! - **内部（Dyn）**: `DynJob` - object-safe。worker は decode 結果をこれで受け取る

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use super::codec::{CodecError, JobEnvelope, PayloadCodec};
use super::job::{Job, JobContext};
use crate::domain::{DEFAULT_QUEUE, ExecutionError, JobUid, Lease, RecordId, WaitExpr};
use crate::error::JobError;
use crate::ports::RetryDecision;
use crate::queue::Queue;

/// How one execution ended.
#[derive(Debug)]
pub enum RunOutcome {
    Succeeded,

    /// The record goes back to `queued` and becomes claimable at `at`.
    RetryScheduled { at: DateTime<Utc>, error: ExecutionError },

    /// Terminal: either no retry was requested or the attempt budget is spent.
    Failed { error: ExecutionError },

    /// The job failed, but by the time it reported back its claim had been
    /// reaped and the row belonged to someone else. The row was left alone.
    ClaimLost { error: ExecutionError },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::RetryScheduled { .. } => "retry_scheduled",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::ClaimLost { .. } => "claim_lost",
        }
    }
}

/// A job value bound to its arguments plus the bookkeeping needed to round-trip
/// through a queue.
///
/// Owned by exactly one producer or worker; never shared.
#[derive(Debug)]
pub struct JobRuntime<J: Job> {
    uid: JobUid,
    queue: String,
    wait: WaitExpr,
    job: J,
    args: J::Args,

    /// Mirrors the record's counter after a claim.
    attempts: u32,

    /// Record id once enqueued.
    backend_id: Option<RecordId>,

    /// Set only while this runtime owns a claim on `backend_id`. Never persisted.
    lease: Option<Lease>,

    enqueued_at: Option<DateTime<Utc>>,
}

impl<J: Job> JobRuntime<J> {
    pub fn new(job: J, args: J::Args) -> Self {
        Self {
            uid: JobUid::generate(),
            queue: DEFAULT_QUEUE.to_string(),
            wait: WaitExpr::NOW,
            job,
            args,
            attempts: 0,
            backend_id: None,
            lease: None,
            enqueued_at: None,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Delay applied by `dispatch` (relative to the queue's clock).
    pub fn delay(mut self, wait: WaitExpr) -> Self {
        self.wait = wait;
        self
    }

    /// Replace the generated identity (e.g. with one from an `IdGenerator`).
    pub fn with_uid(mut self, uid: JobUid) -> Self {
        self.uid = uid;
        self
    }

    pub fn uid(&self) -> JobUid {
        self.uid
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn wait(&self) -> WaitExpr {
        self.wait
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    pub fn job_mut(&mut self) -> &mut J {
        &mut self.job
    }

    pub fn args(&self) -> &J::Args {
        &self.args
    }

    /// Current try count.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn backend_id(&self) -> Option<RecordId> {
        self.backend_id
    }

    pub fn lease(&self) -> Option<Lease> {
        self.lease
    }

    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.enqueued_at
    }

    pub fn is_enqueued(&self) -> bool {
        self.backend_id.is_some()
    }

    /// Enqueue with `run_at = now + wait`.
    pub async fn dispatch(&mut self, queue: &Queue) -> Result<RecordId, JobError> {
        let run_at = queue.due_after(self.wait)?;
        queue.add(self, run_at).await
    }

    pub async fn dispatch_at(&mut self, queue: &Queue, run_at: DateTime<Utc>) -> Result<RecordId, JobError> {
        queue.add(self, run_at).await
    }

    /// Run the full lifecycle in the calling task.
    ///
    /// A job that was never enqueued never touches the store, even when
    /// `queue` is given. An enqueued job may only run here if it holds the
    /// claim on its row (it came from `Queue::claim_next` or
    /// `PayloadCodec::decode_claimed`); it then reports its result to `queue`
    /// and therefore requires one. Anything else is `Detached` and nothing runs,
    /// since a worker could pick up the same row meanwhile.
    #[instrument(skip_all, fields(job_type = J::TYPE, uid = %self.uid, attempts = self.attempts))]
    pub async fn dispatch_now(&mut self, queue: Option<&Queue>) -> Result<RunOutcome, JobError> {
        let store = match (self.backend_id, self.lease, queue) {
            (None, _, _) => None,
            (Some(_), Some(_), Some(queue)) => Some(queue),
            (Some(record_id), _, _) => {
                return Err(JobError::Detached {
                    uid: self.uid,
                    record_id,
                });
            }
        };

        let mut ctx = JobContext::new(self.uid, self.queue.clone(), self.attempts, self.backend_id);

        self.job.startup(&ctx).await;
        let result = match self.job.timeout() {
            Some(limit) => match tokio::time::timeout(limit, self.job.execute(&ctx, &self.args)).await {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::timed_out(limit)),
            },
            None => self.job.execute(&ctx, &self.args).await,
        };
        self.job.shutdown(&ctx).await;

        let error = match result {
            Ok(()) => {
                if let Some(queue) = store {
                    queue.succeed(self).await?;
                }
                if let Err(err) = self.job.on_success(&ctx, &self.args).await {
                    warn!(error = %err, "on_success hook failed");
                }
                return Ok(RunOutcome::Succeeded);
            }
            Err(error) => error,
        };

        debug!(error = %error, "execute failed");
        if let Err(source) = self.job.on_error(&mut ctx, &error).await {
            return Err(JobError::Hook {
                job_type: J::TYPE,
                source,
            });
        }

        let Some(queue) = store else {
            if ctx.retry_requested().is_some() {
                debug!("retry requested for a job that is not enqueued; ignoring");
            }
            return Ok(RunOutcome::Failed { error });
        };

        match ctx.take_retry() {
            Some(options) => match queue.retry(self, &options).await? {
                RetryDecision::Rescheduled { scheduled_at } => Ok(RunOutcome::RetryScheduled {
                    at: scheduled_at,
                    error,
                }),
                RetryDecision::Failed { .. } => Ok(RunOutcome::Failed { error }),
                RetryDecision::NotOwned => Ok(RunOutcome::ClaimLost { error }),
            },
            None => {
                if queue.fail(self).await? {
                    Ok(RunOutcome::Failed { error })
                } else {
                    Ok(RunOutcome::ClaimLost { error })
                }
            }
        }
    }

    pub(crate) fn mark_enqueued(&mut self, record_id: RecordId, at: DateTime<Utc>) {
        self.backend_id = Some(record_id);
        self.enqueued_at = Some(at);
    }

    pub(crate) fn set_enqueued_at(&mut self, at: DateTime<Utc>) {
        self.enqueued_at = Some(at);
    }

    /// Take over a claim. The row's attempt count is authoritative.
    pub(crate) fn bind_lease(&mut self, lease: Lease) {
        self.backend_id = Some(lease.record_id);
        self.attempts = lease.attempts;
        self.lease = Some(lease);
    }

    pub(crate) fn to_envelope(&self) -> Result<JobEnvelope, CodecError> {
        let to_value = |value: serde_json::Result<serde_json::Value>| {
            value.map_err(|source| CodecError::Serialize {
                job_type: J::TYPE,
                source,
            })
        };

        Ok(JobEnvelope {
            job_type: J::TYPE.to_string(),
            uid: self.uid,
            backend_id: self.backend_id,
            queue: self.queue.clone(),
            attempts: self.attempts,
            enqueued_at: self.enqueued_at,
            args: to_value(serde_json::to_value(&self.args))?,
            state: to_value(serde_json::to_value(&self.job))?,
        })
    }

    pub(crate) fn from_envelope(envelope: JobEnvelope) -> Result<Self, CodecError> {
        let args = serde_json::from_value(envelope.args).map_err(CodecError::Malformed)?;
        let job = serde_json::from_value(envelope.state).map_err(CodecError::Malformed)?;

        Ok(Self {
            uid: envelope.uid,
            queue: envelope.queue,
            wait: WaitExpr::NOW,
            job,
            args,
            attempts: envelope.attempts,
            backend_id: envelope.backend_id,
            lease: None,
            enqueued_at: envelope.enqueued_at,
        })
    }
}

/// DynJob は object-safe な JobRuntime の抽象化
///
/// registry の decode 関数は `Box<dyn DynJob>` を返す。
/// worker は具体的な型を知らずに実行できる。
#[async_trait]
pub trait DynJob: Send + Sync {
    fn job_type(&self) -> &'static str;

    fn uid(&self) -> JobUid;

    fn queue(&self) -> &str;

    fn attempts(&self) -> u32;

    fn backend_id(&self) -> Option<RecordId>;

    fn lease(&self) -> Option<Lease>;

    fn timeout(&self) -> Option<Duration>;

    /// Attach the claim a worker just took (record id, attempt count, lock).
    fn attach_lease(&mut self, lease: Lease);

    fn encode(&self) -> Result<String, CodecError>;

    async fn run(&mut self, queue: Option<&Queue>) -> Result<RunOutcome, JobError>;
}

#[async_trait]
impl<J: Job> DynJob for JobRuntime<J> {
    fn job_type(&self) -> &'static str {
        J::TYPE
    }

    fn uid(&self) -> JobUid {
        self.uid
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    fn backend_id(&self) -> Option<RecordId> {
        self.backend_id
    }

    fn lease(&self) -> Option<Lease> {
        self.lease
    }

    fn timeout(&self) -> Option<Duration> {
        self.job.timeout()
    }

    fn attach_lease(&mut self, lease: Lease) {
        self.bind_lease(lease);
    }

    fn encode(&self) -> Result<String, CodecError> {
        PayloadCodec::encode(self)
    }

    async fn run(&mut self, queue: Option<&Queue>) -> Result<RunOutcome, JobError> {
        self.dispatch_now(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryJobStore;
    use crate::ports::{FixedClock, JobStore};
    use crate::typed::{JobRegistry, RetryOptions};
    use crate::domain::JobStatus;
    use chrono::TimeZone;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    /// Records which hooks ran. Fails while `failures_left > 0`.
    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Tracer {
        failures_left: u32,
        retry: bool,
        hooks: Vec<String>,
        #[serde(default)]
        broken_error_hook: bool,
    }

    #[async_trait]
    impl Job for Tracer {
        const TYPE: &'static str = "test.tracer.v1";
        type Args = String;

        async fn startup(&mut self, _ctx: &JobContext) {
            self.hooks.push("startup".into());
        }

        async fn execute(&mut self, _ctx: &JobContext, args: &String) -> Result<(), ExecutionError> {
            self.hooks.push(format!("execute:{args}"));
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(ExecutionError::new("boom"));
            }
            Ok(())
        }

        async fn shutdown(&mut self, _ctx: &JobContext) {
            self.hooks.push("shutdown".into());
        }

        async fn on_success(&mut self, _ctx: &JobContext, args: &String) -> Result<(), ExecutionError> {
            self.hooks.push(format!("on_success:{args}"));
            Ok(())
        }

        async fn on_error(&mut self, ctx: &mut JobContext, error: &ExecutionError) -> Result<(), ExecutionError> {
            self.hooks.push(format!("on_error:{}", error.message()));
            if self.broken_error_hook {
                return Err(ExecutionError::new("hook exploded"));
            }
            if self.retry {
                ctx.retry(RetryOptions::new().limit(3).wait(WaitExpr::seconds(10)));
            }
            Ok(())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Sleepy;

    #[async_trait]
    impl Job for Sleepy {
        const TYPE: &'static str = "test.sleepy.v1";
        type Args = ();

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(20))
        }

        async fn execute(&mut self, _ctx: &JobContext, _args: &()) -> Result<(), ExecutionError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn queue_at(t: DateTime<Utc>) -> (Queue, MemoryJobStore) {
        let clock = Arc::new(FixedClock::new(t));
        let store = MemoryJobStore::with_clock(clock.clone());
        let mut registry = JobRegistry::new();
        registry.register::<Tracer>().unwrap();
        let queue = Queue::new("default", Arc::new(store.clone()), Arc::new(registry)).with_clock(clock);
        (queue, store)
    }

    #[tokio::test]
    async fn dispatch_now_success_runs_hooks_in_order() {
        let mut runtime = JobRuntime::new(Tracer::default(), "hi".to_string());
        let outcome = runtime.dispatch_now(None).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(
            runtime.job().hooks,
            vec!["startup", "execute:hi", "shutdown", "on_success:hi"]
        );
    }

    #[tokio::test]
    async fn dispatch_now_failure_runs_shutdown_then_error_hook() {
        let tracer = Tracer {
            failures_left: 1,
            retry: true,
            ..Tracer::default()
        };
        let mut runtime = JobRuntime::new(tracer, "x".to_string());
        let outcome = runtime.dispatch_now(None).await.unwrap();

        // enqueue されていないので retry 要求は store に届かない
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(
            runtime.job().hooks,
            vec!["startup", "execute:x", "shutdown", "on_error:boom"]
        );
    }

    #[tokio::test]
    async fn error_hook_failure_is_a_hook_error() {
        let tracer = Tracer {
            failures_left: 1,
            broken_error_hook: true,
            ..Tracer::default()
        };
        let mut runtime = JobRuntime::new(tracer, "x".to_string());
        let err = runtime.dispatch_now(None).await.unwrap_err();
        assert!(matches!(err, JobError::Hook { job_type: "test.tracer.v1", .. }));
    }

    #[tokio::test]
    async fn timeout_turns_into_execution_error() {
        let mut runtime = JobRuntime::new(Sleepy, ());
        let outcome = runtime.dispatch_now(None).await.unwrap();
        match outcome {
            RunOutcome::Failed { error } => assert!(error.message().contains("timeout")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn enqueued_job_without_queue_is_detached() {
        let (queue, _) = queue_at(t0());
        let mut runtime = JobRuntime::new(Tracer::default(), "x".to_string());
        let id = runtime.dispatch(&queue).await.unwrap();

        let err = runtime.dispatch_now(None).await.unwrap_err();
        assert!(matches!(err, JobError::Detached { record_id, .. } if record_id == id));
    }

    #[tokio::test]
    async fn enqueued_but_unclaimed_job_does_not_run_in_foreground() {
        let (queue, store) = queue_at(t0());
        let mut runtime = JobRuntime::new(Tracer::default(), "x".to_string());
        let id = runtime.dispatch(&queue).await.unwrap();
        assert_eq!(runtime.backend_id(), Some(id));
        assert_eq!(runtime.enqueued_at(), Some(t0()));
        assert_eq!(runtime.lease(), None);

        let err = runtime.dispatch_now(Some(&queue)).await.unwrap_err();
        assert!(matches!(err, JobError::Detached { record_id, .. } if record_id == id));
        assert!(runtime.job().hooks.is_empty());

        // 行はそのまま、worker が普通に取れる
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!((row.attempts, row.locked), (0, None));
        assert!(queue.claim_next("default").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claimed_job_run_in_foreground_cleans_up_its_record() {
        let (queue, store) = queue_at(t0());
        let id = JobRuntime::new(Tracer::default(), "x".to_string())
            .dispatch(&queue)
            .await
            .unwrap();

        let record = store.claim_next("default").await.unwrap().unwrap();
        let mut runtime = PayloadCodec::decode_claimed::<Tracer>(&record).unwrap();
        assert_eq!(runtime.attempts(), 1);

        let outcome = runtime.dispatch_now(Some(&queue)).await.unwrap();
        assert!(outcome.is_success());
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_retry_request_reschedules_with_new_payload() {
        let (queue, store) = queue_at(t0());
        let tracer = Tracer {
            failures_left: 2,
            retry: true,
            ..Tracer::default()
        };
        JobRuntime::new(tracer, "x".to_string())
            .dispatch(&queue)
            .await
            .unwrap();

        let mut claimed = queue.claim_next("default").await.unwrap().unwrap().into_job().unwrap();
        let outcome = claimed.run(Some(&queue)).await.unwrap();
        assert!(matches!(outcome, RunOutcome::RetryScheduled { at, .. } if at == t0() + chrono::Duration::seconds(10)));

        let row = store.snapshot().await.remove(0);
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.locked, None);

        // ジョブの状態（failures_left, hooks）も再シリアライズされている
        let stored = PayloadCodec::decode_as::<Tracer>(&row.data).unwrap();
        assert_eq!(stored.job().failures_left, 1);
        assert_eq!(stored.backend_id(), Some(row.id));
    }

    #[tokio::test]
    async fn failure_without_retry_marks_record_failed() {
        let (queue, store) = queue_at(t0());
        let tracer = Tracer {
            failures_left: 1,
            ..Tracer::default()
        };
        let id = JobRuntime::new(tracer, "x".to_string())
            .dispatch(&queue)
            .await
            .unwrap();

        let mut claimed = queue.claim_next("default").await.unwrap().unwrap().into_job().unwrap();
        let outcome = claimed.run(Some(&queue)).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }));

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.locked, None);
    }

    #[tokio::test]
    async fn dispatch_uses_delay() {
        let (queue, store) = queue_at(t0());
        let id = JobRuntime::new(Tracer::default(), "x".to_string())
            .delay(WaitExpr::seconds(30))
            .dispatch(&queue)
            .await
            .unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.scheduled_at, t0() + chrono::Duration::seconds(30));
        assert!(queue.claim_next("default").await.unwrap().is_none());
    }
}
