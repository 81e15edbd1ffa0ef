//! IdGenerator port - JobUid 生成の抽象化
//!
//! 複数プロセスが調整なしで ID を作れるように ULID を使う。
//! テスト容易性のために trait として切り出している。

use crate::domain::JobUid;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散環境で使える JobUid を生成
pub trait IdGenerator: Send + Sync {
    fn generate_job_uid(&self) -> JobUid;
}

/// UlidGenerator は Clock の時刻を timestamp 部分に使う
///
/// FixedClock を渡すと timestamp 部分が決定的になる（ランダム部分は毎回変わる）。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_job_uid(&self) -> JobUid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        JobUid::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}
