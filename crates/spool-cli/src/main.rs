use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};
use tracing::info;

use spool_core::app::{AppBuilder, WorkerGroup};
use spool_core::domain::{ExecutionError, WaitExpr};
use spool_core::observability::init_tracing;
use spool_core::{Job, JobContext, JobRuntime, RetryOptions, SpoolConfig};

/// 最初の `fail_times` 回はわざと失敗する挨拶ジョブ
#[derive(Debug, Serialize, Deserialize)]
struct HelloJob {
    fail_times: u32,
}

#[async_trait]
impl Job for HelloJob {
    const TYPE: &'static str = "demo.hello.v1";
    type Args = String;

    fn timeout(&self) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_secs(5))
    }

    async fn execute(&mut self, ctx: &JobContext, name: &String) -> Result<(), ExecutionError> {
        if ctx.attempts() <= self.fail_times {
            return Err(ExecutionError::new(format!(
                "intentional failure (attempt={})",
                ctx.attempts()
            )));
        }

        println!("Hello, {name}! (attempt={})", ctx.attempts());
        Ok(())
    }

    async fn on_error(&mut self, ctx: &mut JobContext, _error: &ExecutionError) -> Result<(), ExecutionError> {
        // 1 秒後にもう一度。上限は 3 回
        ctx.retry(RetryOptions::new().wait(WaitExpr::seconds(1)).limit(3));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // (A) 設定とログ
    let config = SpoolConfig::from_env()?;
    init_tracing(config.log_format);

    // (B) registry と接続を構築（足りない job type があればここで落ちる）
    let app = AppBuilder::new()
        .config(config)
        .register::<HelloJob>()?
        .expect_jobs(&[HelloJob::TYPE])
        .build()
        .await?;
    let queue = app.connections.default_connection()?.clone();
    let queue_name = app.config.worker.queue.clone();

    // (C) ジョブ投入。"mallory" は上限まで失敗して failed に残る
    for (name, fail_times) in [("spool", 0), ("ferris", 2), ("mallory", 5)] {
        let mut job = JobRuntime::new(HelloJob { fail_times }, name.to_string()).on_queue(queue_name.clone());
        let id = job.dispatch(&queue).await?;
        info!(record_id = %id, uid = %job.uid(), name, "enqueued");
    }

    // (D) worker を起動
    let workers = WorkerGroup::spawn(queue.clone(), &app.config.worker);

    // (E) 全部片付くまでポーリング
    loop {
        let counts = queue.counts(&queue_name).await?;
        if counts.pending() == 0 {
            println!("final counts: {counts:?}");
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }

    let purged = queue.purge(Some(&queue_name)).await?;
    println!("purged {purged} failed job(s)");

    workers.shutdown_and_join().await;
    Ok(())
}
