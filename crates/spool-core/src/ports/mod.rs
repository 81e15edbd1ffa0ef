//! Ports - 抽象化レイヤー
//!
//! 外部システム（PostgreSQL、時計）へのインターフェースを定義する。
//! 実装は `impls` にある。

pub mod clock;
pub mod id_generator;
pub mod job_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_store::{JobStore, RetryDecision, StoreError};
