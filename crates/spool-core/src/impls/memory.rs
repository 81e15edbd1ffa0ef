//! In-memory job store.
//!
//! Same semantics as the PostgreSQL store, with a single mutex standing in for
//! row locks: every operation runs while holding it, so a claim is atomic.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::domain::{JobRecord, JobStatus, Lease, NewJobRecord, RecordId};
use crate::observability::QueueCounts;
use crate::ports::{Clock, JobStore, RetryDecision, StoreError, SystemClock};

/// In-memory store state.
struct MemoryState {
    /// All rows, ordered by id (so iteration order == FIFO order).
    records: BTreeMap<RecordId, JobRecord>,

    /// Next id to assign.
    next_id: i64,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> RecordId {
        let id = RecordId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn get_mut(&mut self, id: RecordId) -> Result<&mut JobRecord, StoreError> {
        self.records.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    /// The row, but only while `lease` still owns it.
    fn held(&mut self, lease: &Lease) -> Option<&mut JobRecord> {
        let held = self
            .records
            .get_mut(&lease.record_id)
            .filter(|record| record.is_held_by(lease));
        if held.is_none() {
            warn!(%lease, "lease no longer owns the record; leaving it untouched");
        }
        held
    }
}

/// In-memory job store for tests and the demo binary.
#[derive(Clone)]
pub struct MemoryJobStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::new())),
            clock,
        }
    }

    /// Every row, in id order (for tests and inspection).
    pub async fn snapshot(&self) -> Vec<JobRecord> {
        let state = self.state.lock().await;
        state.records.values().cloned().collect()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    #[instrument(skip(self, new), fields(queue = %new.queue), err)]
    async fn insert(&self, new: NewJobRecord) -> Result<RecordId, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.records.insert(id, JobRecord::inserted(id, new, now));
        Ok(id)
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, queue: &str) -> Result<Option<JobRecord>, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;

        // BTreeMap は id 昇順なので最初に見つかったものが最古
        let claimed = state
            .records
            .values_mut()
            .find(|r| r.queue == queue && r.is_claimable(now))
            .map(|record| {
                record.claim(now);
                record.clone()
            });

        Ok(claimed)
    }

    async fn get(&self, id: RecordId) -> Result<Option<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    #[instrument(skip(self, lease), fields(record_id = %lease.record_id, attempts = lease.attempts), err)]
    async fn complete(&self, lease: &Lease) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.held(lease).is_none() {
            return Ok(false);
        }
        Ok(state.records.remove(&lease.record_id).is_some())
    }

    #[instrument(skip(self, lease), fields(record_id = %lease.record_id, attempts = lease.attempts), err)]
    async fn fail_claimed(&self, lease: &Lease) -> Result<bool, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        match state.held(lease) {
            Some(record) => {
                record.mark_failed(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[instrument(skip(self), fields(record_id = %id), err)]
    async fn mark_failed(&self, id: RecordId) -> Result<(), StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;
        state.get_mut(id)?.mark_failed(now);
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
        let now = self.now();
        let mut state = self.state.lock().await;
        let Some(record) = state.held(lease) else {
            return Ok(RetryDecision::NotOwned);
        };

        if record.attempts < max_attempts {
            record.reschedule(data.to_string(), scheduled_at, now);
            Ok(RetryDecision::Rescheduled { scheduled_at })
        } else {
            record.mark_failed(now);
            Ok(RetryDecision::Failed {
                attempts: record.attempts,
            })
        }
    }

    #[instrument(skip(self), err)]
    async fn purge(&self, queue: Option<&str>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.records.len();
        state.records.retain(|_, r| {
            let in_scope = queue.is_none_or(|q| r.queue == q);
            !(in_scope && r.status.is_terminal())
        });
        Ok((before - state.records.len()) as u64)
    }

    #[instrument(skip(self), err)]
    async fn release_expired(&self, lock_timeout: Duration) -> Result<u64, StoreError> {
        let now = self.now();
        let cutoff = now - lock_timeout;
        let mut state = self.state.lock().await;

        let mut released = 0;
        for record in state.records.values_mut() {
            if record.locked.is_some_and(|locked| locked < cutoff) {
                record.release(now);
                released += 1;
            }
        }
        Ok(released)
    }

    #[instrument(skip(self), fields(record_id = %id), err)]
    async fn replay(&self, id: RecordId) -> Result<RecordId, StoreError> {
        let now = self.now();
        let mut state = self.state.lock().await;

        let old = state.records.get(&id).ok_or(StoreError::NotFound(id))?;
        if old.status != JobStatus::Failed {
            return Err(StoreError::Constraint(format!(
                "record {id} is not failed and cannot be replayed"
            )));
        }
        let new = NewJobRecord::new(old.queue.clone(), old.data.clone(), now);

        state.records.remove(&id);
        let new_id = state.allocate_id();
        state.records.insert(new_id, JobRecord::inserted(new_id, new, now));
        Ok(new_id)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, StoreError> {
        let now = self.now();
        let state = self.state.lock().await;

        let mut counts = QueueCounts::default();
        for record in state.records.values().filter(|r| r.queue == queue) {
            match (record.status, record.locked) {
                (JobStatus::Failed, _) => counts.failed += 1,
                (JobStatus::Queued, Some(_)) => counts.locked += 1,
                (JobStatus::Queued, None) if record.scheduled_at <= now => counts.queued += 1,
                (JobStatus::Queued, None) => counts.scheduled += 1,
            }
        }
        Ok(counts)
    }
}
