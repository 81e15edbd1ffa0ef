//! ReaperLoop - 放置された lock の回収
//!
//! worker がクラッシュすると行は lock されたまま残る。
//! `lock_timeout` より古い lock を外して再び claim できるようにする。
//! attempts はそのまま（クラッシュした試行も 1 回と数える）。

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::ports::StoreError;
use crate::queue::Queue;

pub struct ReaperLoop {
    queue: Queue,
    lock_timeout: Duration,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(queue: Queue, config: &WorkerConfig) -> Self {
        Self {
            queue,
            lock_timeout: config.lock_timeout,
            interval: config.reap_interval,
        }
    }

    /// One sweep. Returns how many rows were unlocked.
    pub async fn reap_once(&self) -> Result<u64, StoreError> {
        let timeout = chrono::Duration::from_std(self.lock_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let released = self.queue.release_expired(timeout).await?;
        if released > 0 {
            info!(released, "released abandoned job locks");
        }
        Ok(released)
    }

    /// Sweep every `interval` until shutdown is signalled.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.reap_once().await {
                warn!(error = %err, "reaper sweep failed");
            }
        }

        debug!("reaper stopped");
    }
}
