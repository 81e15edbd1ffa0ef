//! WorkerLoop - ジョブ実行ループ
//!
//! # フロー（1 イテレーション）
//! 1. `Queue::claim_next()` で行を lock + attempts++ して decode
//! 2. decode できなければ `failed` にして次へ（execute は呼ばない）
//! 3. `DynJob::run()` → startup / execute（timeout 付き）/ shutdown / hook
//! 4. 結果（succeed / retry / fail）は run の中で store に反映済み。
//!    claim の lease が reaper に外されていたら行には触らない
//!
//! ストア障害はログに出して少し待ってから続ける。
//! 行は lock されたまま残るが、ReaperLoop が lock_timeout 後に解放する。

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::reaper_loop::ReaperLoop;
use crate::config::WorkerConfig;
use crate::domain::RecordId;
use crate::error::JobError;
use crate::queue::{Claim, Queue};
use crate::typed::{CodecError, RunOutcome};

/// What one iteration did.
#[derive(Debug)]
pub enum Processed {
    Ran {
        record_id: Option<RecordId>,
        job_type: &'static str,
        outcome: RunOutcome,
    },
    Undecodable {
        record_id: RecordId,
        error: CodecError,
    },
}

/// Claim and run at most one job from `queue_name`.
///
/// `Ok(None)` means nothing was due.
pub async fn run_once(queue: &Queue, queue_name: &str) -> Result<Option<Processed>, JobError> {
    let Some(claim) = queue.claim_next(queue_name).await? else {
        return Ok(None);
    };

    let mut job = match claim {
        Claim::Job(job) => job,
        Claim::Undecodable { record, lease, error } => {
            error!(record_id = %record.id, error = %error, "undecodable job; marking failed");
            queue.fail_claim(&lease).await?;
            return Ok(Some(Processed::Undecodable {
                record_id: record.id,
                error,
            }));
        }
    };

    let record_id = job.backend_id();
    let lease = job.lease();
    let job_type = job.job_type();
    debug!(job_type, uid = %job.uid(), attempts = job.attempts(), "job claimed");

    match job.run(Some(queue)).await {
        Ok(outcome) => {
            match &outcome {
                RunOutcome::Succeeded => debug!(job_type, "job succeeded"),
                RunOutcome::RetryScheduled { at, error } => {
                    warn!(job_type, error = %error, retry_at = %at, "job failed; retry scheduled")
                }
                RunOutcome::Failed { error } => warn!(job_type, error = %error, "job failed"),
                RunOutcome::ClaimLost { error } => {
                    warn!(job_type, error = %error, "job failed after its claim was reaped; row left to the new owner")
                }
            }
            Ok(Some(Processed::Ran {
                record_id,
                job_type,
                outcome,
            }))
        }
        Err(err @ JobError::Hook { .. }) => {
            // hook のバグは自動リトライしない
            if let Some(lease) = lease {
                queue.fail_claim(&lease).await?;
            }
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Worker group handle.
/// - `shutdown_tx` を drop するとワーカー全体が止まる
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `config.concurrency` workers on `config.queue`, plus one reaper.
    pub fn spawn(queue: Queue, config: &WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(config.concurrency + 1);
        for worker_id in 0..config.concurrency {
            let q = queue.clone();
            let queue_name = config.queue.clone();
            let poll_interval = config.poll_interval;
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, q, queue_name, poll_interval, &mut rx).await;
            }));
        }

        let reaper = ReaperLoop::new(queue, config);
        let rx = shutdown_rx.clone();
        joins.push(tokio::spawn(reaper.run(rx)));

        info!(queue = %config.queue, workers = config.concurrency, "worker group started");
        Self { shutdown_tx, joins }
    }

    /// Stop taking new jobs. In-flight executions finish normally.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Queue,
    queue_name: String,
    poll_interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        // shutdown が来ていたら抜ける
        if *shutdown_rx.borrow() {
            break;
        }

        let pause = match run_once(&queue, &queue_name).await {
            // 続けて次を取りに行く
            Ok(Some(_)) => continue,
            Ok(None) => poll_interval,
            Err(err) if err.is_transient() => {
                warn!(worker_id, error = %err, "transient storage fault");
                poll_interval
            }
            Err(err) => {
                error!(worker_id, error = %err, "worker iteration failed");
                poll_interval
            }
        };

        // 待っている間も shutdown に反応する
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender が drop された = 停止
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }

    debug!(worker_id, "worker stopped");
}
