//! spool-core
//!
//! Persistent job queue: at-least-once execution of typed jobs, with delayed
//! scheduling, crash-safe claiming and bounded retry.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, record, wait, errors）
//! - **ports**: 抽象化レイヤー（JobStore, Clock, IdGenerator）
//! - **typed**: 型付き Job API（Job trait, JobRuntime, JobRegistry, PayloadCodec）
//! - **queue**: Queue ハンドル、接続一覧、RetryPolicy
//! - **impls**: JobStore の実装（PostgreSQL, in-memory）
//! - **app**: AppBuilder, WorkerGroup, ReaperLoop
//! - **config** / **observability** / **error**

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod typed;

pub use crate::config::SpoolConfig;
pub use crate::error::JobError;
pub use crate::queue::{Claim, Queue, QueueConnections, RetryPolicy};
pub use crate::typed::{Job, JobContext, JobRegistry, JobRuntime, RetryOptions, RunOutcome};
