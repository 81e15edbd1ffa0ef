//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **PgJobStore**: 本番用。PostgreSQL の行ロック（SKIP LOCKED）で claim する
//! - **MemoryJobStore**: テスト・デモ用。同じ意味論を 1 つの Mutex で実現する

pub mod memory;
pub mod postgres;

// 主要な型を再エクスポート
pub use self::memory::MemoryJobStore;
pub use self::postgres::PgJobStore;
