//! Job trait - 型付きジョブの定義
//!
//! ライフサイクル hook は default no-op のメソッドとして持つ。
//! 実装側は `execute` だけ書けばよい。
//!
//! # 呼び出し順
//! `startup → execute → shutdown → (on_success | on_error)`

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{ExecutionError, JobUid, RecordId, WaitExpr};

/// Job は job type 文字列と型を対応付け、実行時の hook を提供する
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendMail;
///
/// #[async_trait]
/// impl Job for SendMail {
///     const TYPE: &'static str = "mail.send.v1";
///     type Args = (String, String);
///
///     async fn execute(&mut self, _ctx: &JobContext, (to, body): &Self::Args) -> Result<(), ExecutionError> {
///         deliver(to, body).await.map_err(ExecutionError::wrap)
///     }
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize + DeserializeOwned`: ジョブ自身の状態も payload に入る（retry で再シリアライズされる）
/// - `Send + Sync + 'static`: worker タスク間で Box<dyn DynJob> として動かすため
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable key stored in payloads and looked up by the registry.
    ///
    /// 命名規約: `{domain}.{action}.v{major}`
    const TYPE: &'static str;

    /// Arguments handed to `execute` and `on_success`.
    type Args: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;

    /// Hard deadline the worker enforces around `execute`. `None` = unbounded.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn startup(&mut self, _ctx: &JobContext) {}

    async fn execute(&mut self, ctx: &JobContext, args: &Self::Args) -> Result<(), ExecutionError>;

    /// Runs after `execute` on both paths.
    async fn shutdown(&mut self, _ctx: &JobContext) {}

    /// Runs after the store has forgotten the job. Errors here are only logged.
    async fn on_success(&mut self, _ctx: &JobContext, _args: &Self::Args) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Decide what happens after a failed `execute`.
    ///
    /// Call `ctx.retry(..)` to reschedule; returning without doing so fails the job.
    /// An `Err` here is a programming defect and aborts the worker iteration.
    async fn on_error(&mut self, _ctx: &mut JobContext, _error: &ExecutionError) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// What `retry` should do. Unset fields fall back to the queue's `RetryPolicy`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOptions {
    pub wait: Option<WaitExpr>,
    pub limit: Option<u32>,
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(mut self, wait: WaitExpr) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Per-execution view of the job handed to every hook.
#[derive(Debug, Clone)]
pub struct JobContext {
    uid: JobUid,
    queue: String,
    attempts: u32,
    backend_id: Option<RecordId>,
    retry: Option<RetryOptions>,
}

impl JobContext {
    pub(crate) fn new(uid: JobUid, queue: String, attempts: u32, backend_id: Option<RecordId>) -> Self {
        Self {
            uid,
            queue,
            attempts,
            backend_id,
            retry: None,
        }
    }

    pub fn uid(&self) -> JobUid {
        self.uid
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Claims so far, including the current one. 0 for a job that was never enqueued.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn backend_id(&self) -> Option<RecordId> {
        self.backend_id
    }

    pub fn is_enqueued(&self) -> bool {
        self.backend_id.is_some()
    }

    /// Request a retry. The last request wins.
    pub fn retry(&mut self, options: RetryOptions) {
        self.retry = Some(options);
    }

    pub fn retry_requested(&self) -> Option<&RetryOptions> {
        self.retry.as_ref()
    }

    pub(crate) fn take_retry(&mut self) -> Option<RetryOptions> {
        self.retry.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DEFAULT_QUEUE;

    #[test]
    fn retry_options_builder() {
        let options = RetryOptions::new().limit(2).wait(WaitExpr::seconds(5));
        assert_eq!(options.limit, Some(2));
        assert_eq!(options.wait, Some(WaitExpr::seconds(5)));
        assert_eq!(RetryOptions::default(), RetryOptions { wait: None, limit: None });
    }

    #[test]
    fn context_records_last_retry_request() {
        let mut ctx = JobContext::new(JobUid::generate(), DEFAULT_QUEUE.to_string(), 1, Some(RecordId::new(3)));
        assert!(ctx.is_enqueued());
        assert!(ctx.retry_requested().is_none());

        ctx.retry(RetryOptions::new().limit(5));
        ctx.retry(RetryOptions::new().limit(2));
        assert_eq!(ctx.retry_requested().and_then(|o| o.limit), Some(2));

        assert!(ctx.take_retry().is_some());
        assert!(ctx.retry_requested().is_none());
    }
}
