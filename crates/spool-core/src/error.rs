use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{ExecutionError, JobUid, RecordId, WaitExpr};
use crate::ports::StoreError;
use crate::typed::CodecError;

/// Errors surfaced to producers and worker loops.
///
/// A job's own failure (`ExecutionError`) is not in here: the runtime resolves
/// it into retry or fail before returning.
#[derive(Debug, Error)]
pub enum JobError {
    /// Payload could not be decoded (or encoded).
    #[error("decode error: {0}")]
    Decode(#[from] CodecError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// The job's error hook itself failed.
    #[error("error hook of job '{job_type}' failed: {source}")]
    Hook {
        job_type: &'static str,
        #[source]
        source: ExecutionError,
    },

    /// An enqueued job was run without holding the claim on its row, or
    /// without a queue to report to.
    #[error("job {uid} is enqueued as {record_id} but holds no claim on it here")]
    Detached { uid: JobUid, record_id: RecordId },

    #[error("wait {wait} from {from} does not fit in the calendar")]
    Schedule { wait: WaitExpr, from: DateTime<Utc> },
}

impl JobError {
    /// Worth retrying at the transport level (the job itself is not at fault).
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Storage(err) if err.is_transient())
    }
}
