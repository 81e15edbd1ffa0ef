//! App - アプリケーション層
//!
//! Queue と registry を組み合わせてプロセスを動かす部分。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: registry と接続の構築、起動時検証
//! - **WorkerGroup**: claim → decode → run のループを N 本
//! - **ReaperLoop**: 放置された lock の回収

pub mod builder;
pub mod reaper_loop;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::reaper_loop::ReaperLoop;
pub use self::worker_loop::{Processed, WorkerGroup, run_once};
