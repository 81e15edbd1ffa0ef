//! PostgreSQL-backed job store.
//!
//! All rows live in one table, `spool_jobs`. The claim runs in a transaction:
//!
//! 1. `SELECT id ... ORDER BY id LIMIT 1 FOR UPDATE SKIP LOCKED`
//! 2. `UPDATE ... SET locked = now, attempts = attempts + 1`
//! 3. commit
//!
//! so a row is handed to at most one claimer, across processes and hosts, and
//! `attempts` never moves without `locked` moving with it.
//!
//! Every later write by the claimer is guarded by its [`Lease`]
//! (`locked` and `attempts` as returned by the claim), so a worker whose lock
//! was reaped cannot touch the row after someone else reclaimed it.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique / foreign key / check violation) | `23505` / `23503` / `23514` | `Constraint` |
//! | Database (serialization failure / deadlock / lock not available) | `40001` / `40P01` / `55P03` | `Conflict` |
//! | Database (connection exception, admin shutdown) | `08xxx` / `57P01` | `Connection` |
//! | Database (other) | Any other | `Database` |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Connection` |
//! | ColumnDecode / Decode / ColumnNotFound | N/A | `CorruptRow` |
//! | Other | N/A | `Database` |
//!
//! Timestamps come from the store's `Clock`, not from `now()` in SQL, so that
//! both backends agree on due times.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument, warn};

use crate::domain::{JobRecord, JobStatus, Lease, NewJobRecord, RecordId};
use crate::observability::QueueCounts;
use crate::ports::{Clock, JobStore, RetryDecision, StoreError, SystemClock};

/// Idempotent schema; `migrate` runs each statement in order.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS spool_jobs (
        id           BIGSERIAL PRIMARY KEY,
        queue        TEXT        NOT NULL DEFAULT 'default',
        data         TEXT        NOT NULL,
        status       TEXT        NOT NULL DEFAULT 'queued' CHECK (status IN ('queued', 'failed')),
        locked       TIMESTAMPTZ NULL,
        scheduled_at TIMESTAMPTZ NOT NULL,
        attempts     INTEGER     NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        created_at   TIMESTAMPTZ NOT NULL,
        updated_at   TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS spool_jobs_claim_idx
        ON spool_jobs (queue, scheduled_at, id)
        WHERE status = 'queued' AND locked IS NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS spool_jobs_queue_idx ON spool_jobs (queue)
    "#,
];

const COLUMNS: &str = "id, queue, data, status, locked, scheduled_at, attempts, created_at, updated_at";

/// Ownership predicate over `$1 = id, $2 = locked, $3 = attempts`.
const HELD_BY: &str = "id = $1 AND status = 'queued' AND locked = $2 AND attempts = $3";

/// PostgreSQL job store.
///
/// `Clone` shares the pool.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    #[instrument(skip(url), err)]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, new), fields(queue = %new.queue), err)]
    async fn insert(&self, new: NewJobRecord) -> Result<RecordId, StoreError> {
        let now = self.now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO spool_jobs (queue, data, status, locked, scheduled_at, attempts, created_at, updated_at)
            VALUES ($1, $2, 'queued', NULL, $3, 0, $4, $4)
            RETURNING id
            "#,
        )
        .bind(&new.queue)
        .bind(&new.data)
        .bind(new.scheduled_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(RecordId::new(id))
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, queue: &str) -> Result<Option<JobRecord>, StoreError> {
        let now = self.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        // 他の claimer が lock 中の行は飛ばす（待たない）
        let candidate: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM spool_jobs
            WHERE queue = $1 AND status = 'queued' AND locked IS NULL AND scheduled_at <= $2
            ORDER BY id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queue)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let Some(id) = candidate else {
            tx.rollback().await.map_err(|e| map_sqlx_error("claim_next", e))?;
            return Ok(None);
        };

        let row = sqlx::query(&format!(
            "UPDATE spool_jobs SET locked = $2, attempts = attempts + 1, updated_at = $2 \
             WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("claim_next", e))?;

        let record = record_from_row(&row)?;
        debug!(record_id = %record.id, attempts = record.attempts, "row claimed");
        Ok(Some(record))
    }

    async fn get(&self, id: RecordId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM spool_jobs WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self, lease), fields(record_id = %lease.record_id, attempts = lease.attempts), err)]
    async fn complete(&self, lease: &Lease) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!("DELETE FROM spool_jobs WHERE {HELD_BY}"))
            .bind(lease.record_id.get())
            .bind(lease.locked)
            .bind(i64::from(lease.attempts))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("complete", e))?;
        Ok(held(lease, result.rows_affected()))
    }

    #[instrument(skip(self, lease), fields(record_id = %lease.record_id, attempts = lease.attempts), err)]
    async fn fail_claimed(&self, lease: &Lease) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE spool_jobs SET status = 'failed', locked = NULL, updated_at = $4 WHERE {HELD_BY}"
        ))
        .bind(lease.record_id.get())
        .bind(lease.locked)
        .bind(i64::from(lease.attempts))
        .bind(self.now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_claimed", e))?;
        Ok(held(lease, result.rows_affected()))
    }

    #[instrument(skip(self), fields(record_id = %id), err)]
    async fn mark_failed(&self, id: RecordId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE spool_jobs SET status = 'failed', locked = NULL, updated_at = $2 WHERE id = $1",
        )
        .bind(id.get())
        .bind(self.now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, lease, data), fields(record_id = %lease.record_id, attempts = lease.attempts), err)]
    async fn retry(
        &self,
        lease: &Lease,
        data: &str,
        scheduled_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<RetryDecision, StoreError> {
        // 判定は行の attempts で行う（SET の右辺はすべて更新前の値を見る）
        let row = sqlx::query(&format!(
            r#"
            UPDATE spool_jobs SET
                data         = CASE WHEN attempts < $7 THEN $4 ELSE data END,
                scheduled_at = CASE WHEN attempts < $7 THEN $5 ELSE scheduled_at END,
                status       = CASE WHEN attempts < $7 THEN 'queued' ELSE 'failed' END,
                locked       = NULL,
                updated_at   = $6
            WHERE {HELD_BY}
            RETURNING status, attempts
            "#
        ))
        .bind(lease.record_id.get())
        .bind(lease.locked)
        .bind(i64::from(lease.attempts))
        .bind(data)
        .bind(scheduled_at)
        .bind(self.now())
        .bind(i64::from(max_attempts))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry", e))?;

        let Some(row) = row else {
            warn!(%lease, "lease no longer owns the record; leaving it untouched");
            return Ok(RetryDecision::NotOwned);
        };

        let status = parse_status(&row)?;
        let attempts = parse_attempts(&row)?;
        Ok(match status {
            JobStatus::Queued => RetryDecision::Rescheduled { scheduled_at },
            JobStatus::Failed => RetryDecision::Failed { attempts },
        })
    }

    #[instrument(skip(self), err)]
    async fn purge(&self, queue: Option<&str>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM spool_jobs WHERE status = 'failed' AND ($1::TEXT IS NULL OR queue = $1)",
        )
        .bind(queue)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn release_expired(&self, lock_timeout: Duration) -> Result<u64, StoreError> {
        let now = self.now();
        let result = sqlx::query(
            "UPDATE spool_jobs SET locked = NULL, updated_at = $2 WHERE locked IS NOT NULL AND locked < $1",
        )
        .bind(now - lock_timeout)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_expired", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(record_id = %id), err)]
    async fn replay(&self, id: RecordId) -> Result<RecordId, StoreError> {
        let now = self.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("replay", e))?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM spool_jobs WHERE id = $1 FOR UPDATE")
                .bind(id.get())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("replay", e))?;

        match status.as_deref() {
            None => return Err(StoreError::NotFound(id)),
            Some("failed") => {}
            Some(other) => {
                return Err(StoreError::Constraint(format!(
                    "record {id} is {other} and cannot be replayed"
                )));
            }
        }

        let new_id: i64 = sqlx::query_scalar(
            r#"
            WITH old AS (DELETE FROM spool_jobs WHERE id = $1 RETURNING queue, data)
            INSERT INTO spool_jobs (queue, data, status, locked, scheduled_at, attempts, created_at, updated_at)
            SELECT queue, data, 'queued', NULL, $2, 0, $2, $2 FROM old
            RETURNING id
            "#,
        )
        .bind(id.get())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("replay", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("replay", e))?;
        Ok(RecordId::new(new_id))
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued' AND locked IS NULL AND scheduled_at <= $2) AS queued,
                COUNT(*) FILTER (WHERE status = 'queued' AND locked IS NULL AND scheduled_at > $2)  AS scheduled,
                COUNT(*) FILTER (WHERE status = 'queued' AND locked IS NOT NULL)                    AS locked,
                COUNT(*) FILTER (WHERE status = 'failed')                                           AS failed
            FROM spool_jobs
            WHERE queue = $1
            "#,
        )
        .bind(queue)
        .bind(self.now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("counts", e))?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let value: i64 = row
                .try_get(column)
                .map_err(|e| map_sqlx_error("counts", e))?;
            Ok(value.max(0) as u64)
        };

        Ok(QueueCounts {
            queued: count("queued")?,
            scheduled: count("scheduled")?,
            locked: count("locked")?,
            failed: count("failed")?,
        })
    }
}

/// 0 行なら lease はもう無効（削除済み・failed 化・別ワーカーが再 claim）
fn held(lease: &Lease, rows_affected: u64) -> bool {
    if rows_affected == 0 {
        warn!(%lease, "lease no longer owns the record; leaving it untouched");
        return false;
    }
    true
}

fn record_from_row(row: &PgRow) -> Result<JobRecord, StoreError> {
    let get_err = |e| map_sqlx_error("decode_row", e);

    Ok(JobRecord {
        id: RecordId::new(row.try_get("id").map_err(get_err)?),
        queue: row.try_get("queue").map_err(get_err)?,
        data: row.try_get("data").map_err(get_err)?,
        status: parse_status(row)?,
        locked: row.try_get("locked").map_err(get_err)?,
        scheduled_at: row.try_get("scheduled_at").map_err(get_err)?,
        attempts: parse_attempts(row)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

fn parse_status(row: &PgRow) -> Result<JobStatus, StoreError> {
    let raw: String = row
        .try_get("status")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    raw.parse()
        .map_err(|e: crate::domain::record::UnknownStatus| StoreError::CorruptRow(e.to_string()))
}

fn parse_attempts(row: &PgRow) -> Result<u32, StoreError> {
    let raw: i32 = row
        .try_get("attempts")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    u32::try_from(raw).map_err(|_| StoreError::CorruptRow(format!("negative attempts: {raw}")))
}

/// Map SQLx errors to StoreError.
///
/// See the module docs for the full table.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23503") | Some("23514") => StoreError::Constraint(msg),
                Some("40001") | Some("40P01") | Some("55P03") => StoreError::Conflict(msg),
                Some("57P01") => StoreError::Connection(msg),
                Some(code) if code.starts_with("08") => StoreError::Connection(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Connection(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Connection(format!("timed out waiting for a connection in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::Connection(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => StoreError::Connection(format!("tls error in {}: {}", operation, e)),
        e @ (sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)) => {
            StoreError::CorruptRow(format!("in {}: {}", operation, e))
        }
        other => StoreError::Database(format!("sqlx error in {}: {}", operation, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_connection_errors() {
        assert!(matches!(
            map_sqlx_error("claim_next", sqlx::Error::PoolClosed),
            StoreError::Connection(_)
        ));
        assert!(map_sqlx_error("claim_next", sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = map_sqlx_error("insert", sqlx::Error::Io(io));
        assert!(err.is_transient());
        assert!(err.to_string().contains("insert"));
    }

    #[test]
    fn missing_column_is_corrupt_row() {
        let err = map_sqlx_error("get", sqlx::Error::ColumnNotFound("status".into()));
        assert!(matches!(err, StoreError::CorruptRow(_)));
    }

    #[test]
    fn schema_statements_are_idempotent() {
        for statement in SCHEMA {
            assert!(statement.contains("IF NOT EXISTS"), "{statement}");
        }
    }
}
