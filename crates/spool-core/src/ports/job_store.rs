//! JobStore port - ジョブ行の正本（source of truth）
//!
//! JobStore はジョブ行を変更できる唯一のコンポーネント。
//! すべての操作は 1 トランザクションで完結し、途中で失敗したら全体がロールバックされる。
//!
//! # 実装
//! - `impls::PgJobStore`: PostgreSQL（本番用）
//! - `impls::MemoryJobStore`: テスト・デモ用

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::{JobRecord, Lease, NewJobRecord, RecordId};
use crate::observability::QueueCounts;

/// Storage-level failure. Always an infrastructure problem, never a job-logic decision.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job record not found: {0}")]
    NotFound(RecordId),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Deadlock, serialization failure, lock timeout. Safe to retry the whole operation.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("corrupt job row: {0}")]
    CorruptRow(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Transport-level retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Conflict(_))
    }
}

/// What `retry` ended up doing to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// `attempts < max_attempts`: queued again for `scheduled_at`.
    Rescheduled { scheduled_at: DateTime<Utc> },

    /// Budget exhausted: terminal `failed`.
    Failed { attempts: u32 },

    /// The lease no longer matches (row gone, forced to `failed`, or reclaimed
    /// by another worker after a reap). Nothing was changed.
    NotOwned,
}

/// JobStore は jobs テーブルへの全アクセスを担う
///
/// # 設計原則
/// - claim は「ロック + attempts++」を同一トランザクションで行う
/// - 同じ行を 2 つのワーカーが同時に claim することはない
/// - `locked IS NULL AND status = 'queued' AND scheduled_at <= now` 以外の行は claim しない
/// - claim 後の変更（complete / fail_claimed / retry）は lease が一致する行にだけ効く。
///   一致しなければ何も変えずに「持っていない」と返す
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued, unlocked row with `attempts = 0`.
    async fn insert(&self, new: NewJobRecord) -> Result<RecordId, StoreError>;

    /// Atomically claim the oldest (`id ASC`) claimable row of `queue`.
    ///
    /// Returns the row as it is after the claim (locked, attempts incremented).
    async fn claim_next(&self, queue: &str) -> Result<Option<JobRecord>, StoreError>;

    async fn get(&self, id: RecordId) -> Result<Option<JobRecord>, StoreError>;

    /// Delete the row `lease` was taken on. `false` when the lease no longer
    /// matches, so a second call is a no-op rather than an error.
    async fn complete(&self, lease: &Lease) -> Result<bool, StoreError>;

    /// `status = failed, locked = NULL` on a row this lease still owns.
    async fn fail_claimed(&self, lease: &Lease) -> Result<bool, StoreError>;

    /// Operator override: `status = failed, locked = NULL` whoever holds the row.
    async fn mark_failed(&self, id: RecordId) -> Result<(), StoreError>;

    /// Reschedule with a re-serialized payload while `attempts < max_attempts`,
    /// otherwise behave exactly like `fail_claimed`.
    async fn retry(
        &self,
        lease: &Lease,
        data: &str,
        scheduled_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<RetryDecision, StoreError>;

    /// Delete failed rows (of one queue, or all queues).
    async fn purge(&self, queue: Option<&str>) -> Result<u64, StoreError>;

    /// Unlock rows whose owner has held them longer than `lock_timeout`.
    /// `attempts` is left as is.
    async fn release_expired(&self, lock_timeout: Duration) -> Result<u64, StoreError>;

    /// Reinsert a failed row as a fresh queued row (attempts 0) and remove the old one.
    async fn replay(&self, id: RecordId) -> Result<RecordId, StoreError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, StoreError>;
}
