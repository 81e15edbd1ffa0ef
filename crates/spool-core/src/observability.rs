//! Observability: queue counts and tracing setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Snapshot of one queue, for operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Claimable right now.
    pub queued: u64,

    /// Queued but not yet due.
    pub scheduled: u64,

    /// Owned by a worker.
    pub locked: u64,

    pub failed: u64,
}

impl QueueCounts {
    /// Rows that will still run (due, delayed or in flight).
    pub fn pending(&self) -> u64 {
        self.queued + self.scheduled + self.locked
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Initialize tracing for the process (filter from `RUST_LOG`, default `info`).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(false)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
    };
}
